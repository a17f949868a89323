//! E-utilities transport against a mock server.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use biblio_ingest::fetch::{
    EutilsConfig, EutilsSource, FetchError, RateLimitedFetchClient, RecordSource, RetryPolicy,
};
use biblio_ingest::mapping::{PubmedXmlMapper, RecordMapper};
use biblio_ingest::IngestError;
use wiremock::{
    matchers::{method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

const ARTICLE: &str = r#"<?xml version="1.0" ?>
<PubmedArticleSet>
  <PubmedArticle>
    <MedlineCitation Status="MEDLINE" Owner="NLM">
      <PMID Version="1">31452104</PMID>
      <Article PubModel="Print">
        <Journal>
          <ISSN IssnType="Electronic">1476-4687</ISSN>
          <Title>Nature</Title>
          <ISOAbbreviation>Nature</ISOAbbreviation>
        </Journal>
        <ArticleTitle>A mocked article.</ArticleTitle>
        <AuthorList CompleteYN="Y">
          <Author ValidYN="Y">
            <LastName>Doe</LastName>
            <ForeName>Jane</ForeName>
            <Initials>J</Initials>
            <AffiliationInfo>
              <Affiliation>Harvard University, Boston, MA, USA.</Affiliation>
            </AffiliationInfo>
          </Author>
        </AuthorList>
      </Article>
    </MedlineCitation>
    <PubmedData>
      <ArticleIdList>
        <ArticleId IdType="pubmed">31452104</ArticleId>
        <ArticleId IdType="doi">10.1038/S41586-019-1500-0</ArticleId>
      </ArticleIdList>
    </PubmedData>
  </PubmedArticle>
</PubmedArticleSet>"#;

fn source(server: &MockServer) -> EutilsSource {
    EutilsSource::new(EutilsConfig {
        base_url: server.uri(),
        api_key: Some("test-key".to_string()),
        email: Some("dev@example.org".to_string()),
        timeout_secs: 5,
        ..EutilsConfig::default()
    })
    .expect("Failed to build source")
}

#[tokio::test]
async fn test_esearch_pages() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/esearch.fcgi"))
        .and(query_param("term", "crispr"))
        .and(query_param("retstart", "20"))
        .and(query_param("retmax", "2"))
        .and(query_param("api_key", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "header": {"type": "esearch", "version": "0.3"},
            "esearchresult": {"count": "57", "retmax": "2", "retstart": "20", "idlist": ["39000001", "39000002"]}
        })))
        .mount(&server)
        .await;

    let page = source(&server).search("crispr", 20, 2).await.unwrap();
    assert_eq!(page.total, 57);
    assert_eq!(page.identifiers, vec!["39000001", "39000002"]);
}

#[tokio::test]
async fn test_esearch_error_field_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/esearch.fcgi"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "esearchresult": {"ERROR": "Invalid query"}
        })))
        .mount(&server)
        .await;

    let err = source(&server).search("((", 0, 10).await.unwrap_err();
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_efetch_maps_to_record() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/efetch.fcgi"))
        .and(query_param("id", "31452104"))
        .and(query_param("retmode", "xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ARTICLE))
        .mount(&server)
        .await;

    let raw = source(&server).fetch_record("PMID:31452104").await.unwrap();
    assert_eq!(raw.identifier, "31452104");

    let record = PubmedXmlMapper.map(&raw).unwrap();
    assert_eq!(record.document.secondary_id.as_deref(), Some("PMID:31452104"));
    assert_eq!(record.document.title.as_deref(), Some("A mocked article."));
    assert_eq!(record.authors.len(), 1);
    assert_eq!(record.authors[0].affiliations, vec!["Harvard University, Boston, MA, USA."]);
}

#[tokio::test]
async fn test_efetch_without_article_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/efetch.fcgi"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<PubmedArticleSet></PubmedArticleSet>"))
        .mount(&server)
        .await;

    let err = source(&server).fetch_record("1").await.unwrap_err();
    assert!(matches!(err, FetchError::NotFound(_)));
}

#[tokio::test]
async fn test_elink_reference_ids() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/elink.fcgi"))
        .and(query_param("linkname", "pubmed_pubmed_refs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "linksets": [{
                "dbfrom": "pubmed",
                "ids": ["31452104"],
                "linksetdbs": [
                    {"dbto": "pubmed", "linkname": "pubmed_pubmed_refs", "links": ["111", 222]},
                    {"dbto": "pubmed", "linkname": "pubmed_pubmed_citedin", "links": ["999"]}
                ]
            }]
        })))
        .mount(&server)
        .await;

    let ids = source(&server).fetch_reference_ids("31452104").await.unwrap();
    assert_eq!(ids, vec!["111", "222"]);
}

#[tokio::test]
async fn test_rate_limited_responses_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/efetch.fcgi"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/efetch.fcgi"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ARTICLE))
        .mount(&server)
        .await;

    let client = RateLimitedFetchClient::new(
        Arc::new(source(&server)),
        NonZeroU32::new(50).unwrap(),
        RetryPolicy::new(4, Duration::from_millis(5), Duration::from_millis(20)),
    );
    let raw = client.fetch("31452104").await.unwrap();
    assert!(raw.payload.contains("31452104"));
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_client_errors_fail_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/efetch.fcgi"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;

    let client = RateLimitedFetchClient::new(
        Arc::new(source(&server)),
        NonZeroU32::new(50).unwrap(),
        RetryPolicy::new(4, Duration::from_millis(5), Duration::from_millis(20)),
    );
    let err = client.fetch("31452104").await.unwrap_err();
    assert!(matches!(err, IngestError::PermanentFetch { .. }));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);

    let err = client.fetch("not-a-pmid").await.unwrap_err();
    assert!(matches!(
        err,
        IngestError::PermanentFetch { source: FetchError::InvalidIdentifier(_), .. }
    ));
}

const PMC_ARTICLE: &str = r#"<?xml version="1.0" ?>
<pmc-articleset>
  <article xmlns:xlink="http://www.w3.org/1999/xlink" article-type="research-article">
    <front><article-meta><article-id pub-id-type="pmcid">PMC6543210</article-id></article-meta></front>
    <body><sec><title>Introduction</title><p>Open access body text.</p></sec></body>
  </article>
</pmc-articleset>"#;

#[tokio::test]
async fn test_fulltext_fetched_from_pmc_database() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/efetch.fcgi"))
        .and(query_param("db", "pmc"))
        .and(query_param("id", "6543210"))
        .and(query_param("api_key", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_string(PMC_ARTICLE))
        .expect(1)
        .mount(&server)
        .await;

    let client = RateLimitedFetchClient::new(
        Arc::new(source(&server)),
        NonZeroU32::new(50).unwrap(),
        RetryPolicy::new(4, Duration::from_millis(5), Duration::from_millis(20)),
    );
    let raw = client.fetch_fulltext("PMC6543210").await.unwrap();
    assert_eq!(raw.identifier, "PMC6543210");
    assert!(raw.payload.contains("Open access body text."));
}

#[tokio::test]
async fn test_fulltext_error_body_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/efetch.fcgi"))
        .and(query_param("db", "pmc"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<pmc-articleset><error id=\"123\">The following PMCID is not available: 123</error></pmc-articleset>",
        ))
        .mount(&server)
        .await;

    let source = source(&server);
    assert!(matches!(source.fetch_fulltext("123").await, Err(FetchError::NotFound(_))));
    assert!(matches!(
        source.fetch_fulltext("PMC12x").await,
        Err(FetchError::InvalidIdentifier(_))
    ));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}
