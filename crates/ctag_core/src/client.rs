use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::{self, Credentials, CtagConfig};

const LABEL_PAGE_SIZE: usize = 200;
const ERROR_BODY_LIMIT: usize = 300;

/// The remote wiki operations the tool depends on.
pub trait ConfluenceApi {
    /// Run one page of a CQL search, returning the raw `results` items.
    fn search(&mut self, cql: &str, start: usize, limit: usize, expand: &str)
    -> Result<Vec<Value>>;
    fn get_page_labels(&mut self, page_id: &str) -> Result<Vec<String>>;
    fn set_page_label(&mut self, page_id: &str, label: &str) -> Result<()>;
    /// Removing a label the page does not carry succeeds.
    fn remove_page_label(&mut self, page_id: &str, label: &str) -> Result<()>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct ConfluenceClientConfig {
    pub api_root: String,
    pub username: String,
    pub token: String,
    pub user_agent: String,
    pub timeout_ms: u64,
}

impl ConfluenceClientConfig {
    pub fn from_credentials(credentials: &Credentials, config: &CtagConfig) -> Self {
        Self {
            api_root: api_root(&credentials.base_url),
            username: credentials.username.clone(),
            token: credentials.token.clone(),
            user_agent: config::user_agent(config),
            timeout_ms: config::timeout_ms(config),
        }
    }
}

pub struct ConfluenceClient {
    client: Client,
    config: ConfluenceClientConfig,
    request_count: usize,
}

impl ConfluenceClient {
    pub fn new(config: ConfluenceClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()
            .context("failed to build Confluence HTTP client")?;
        Ok(Self {
            client,
            config,
            request_count: 0,
        })
    }

    pub fn api_root(&self) -> &str {
        &self.config.api_root
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_root, path.trim_start_matches('/'))
    }

    fn send(&mut self, request: RequestBuilder, what: &str) -> Result<Response> {
        self.request_count += 1;
        request
            .basic_auth(&self.config.username, Some(&self.config.token))
            .header("Accept", "application/json")
            .send()
            .with_context(|| format!("failed to call Confluence API ({what})"))
    }

    fn get_json(&mut self, path: &str, query: &[(&str, String)], what: &str) -> Result<Value> {
        let request = self.client.get(self.url(path)).query(query);
        let response = self.send(request, what)?;
        let response = ensure_success(response, what)?;
        response
            .json()
            .with_context(|| format!("failed to decode Confluence API JSON response ({what})"))
    }
}

impl ConfluenceApi for ConfluenceClient {
    fn search(
        &mut self,
        cql: &str,
        start: usize,
        limit: usize,
        expand: &str,
    ) -> Result<Vec<Value>> {
        let mut query = vec![
            ("cql", cql.to_string()),
            ("start", start.to_string()),
            ("limit", limit.to_string()),
        ];
        if !expand.trim().is_empty() {
            query.push(("expand", expand.to_string()));
        }
        let payload = self.get_json("content/search", &query, "CQL search")?;
        parse_search_results(payload)
    }

    fn get_page_labels(&mut self, page_id: &str) -> Result<Vec<String>> {
        let path = format!("content/{page_id}/label");
        let mut labels = Vec::new();
        let mut start = 0usize;
        loop {
            let payload = self.get_json(
                &path,
                &[
                    ("start", start.to_string()),
                    ("limit", LABEL_PAGE_SIZE.to_string()),
                ],
                "get labels",
            )?;
            let parsed: LabelsResponse =
                serde_json::from_value(payload).context("failed to decode labels response")?;
            let batch_len = parsed.results.len();
            labels.extend(parsed.results.into_iter().map(|label| label.name));
            if batch_len < LABEL_PAGE_SIZE {
                break;
            }
            start += batch_len;
        }
        Ok(labels)
    }

    fn set_page_label(&mut self, page_id: &str, label: &str) -> Result<()> {
        let request = self
            .client
            .post(self.url(&format!("content/{page_id}/label")))
            .json(&json!([{ "prefix": "global", "name": label }]));
        let response = self.send(request, "add label")?;
        ensure_success(response, "add label")
            .with_context(|| format!("failed to add tag '{label}' to page {page_id}"))?;
        debug!(page_id, label, "added label");
        Ok(())
    }

    fn remove_page_label(&mut self, page_id: &str, label: &str) -> Result<()> {
        let request = self
            .client
            .delete(self.url(&format!("content/{page_id}/label")))
            .query(&[("name", label)]);
        let response = self.send(request, "remove label")?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(page_id, label, "label not present; nothing to remove");
            return Ok(());
        }
        ensure_success(response, "remove label")
            .with_context(|| format!("failed to remove tag '{label}' from page {page_id}"))?;
        debug!(page_id, label, "removed label");
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// REST root for a Confluence Cloud site, tolerating a trailing `/` or `/wiki`.
pub fn api_root(base_url: &str) -> String {
    let trimmed = base_url.trim().trim_end_matches('/');
    let site = trimmed.strip_suffix("/wiki").unwrap_or(trimmed);
    format!("{site}/wiki/rest/api")
}

/// Pull the `results` array out of a search payload; a bare array is accepted too.
pub fn parse_search_results(payload: Value) -> Result<Vec<Value>> {
    match payload {
        Value::Array(items) => Ok(items),
        Value::Object(mut object) => match object.remove("results") {
            Some(Value::Array(items)) => Ok(items),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(other) => bail!("unexpected search results shape: {other}"),
        },
        other => bail!("unexpected search response shape: {other}"),
    }
}

fn ensure_success(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    let snippet = body.chars().take(ERROR_BODY_LIMIT).collect::<String>();
    bail!("Confluence API {what} failed with HTTP {status}: {}", snippet.trim())
}

#[derive(Debug, Deserialize, Default)]
struct LabelsResponse {
    #[serde(default)]
    results: Vec<LabelItem>,
}

#[derive(Debug, Deserialize)]
struct LabelItem {
    name: String,
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    use serde_json::json;

    use super::{
        ConfluenceApi, ConfluenceClient, ConfluenceClientConfig, LabelsResponse, api_root,
        parse_search_results,
    };

    /// Answers one connection per canned `(status, body)`, in order, and hands
    /// back the request lines it received.
    fn serve(responses: Vec<(u16, String)>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fixture server");
        let address = listener.local_addr().expect("fixture address");
        let handle = thread::spawn(move || {
            let mut requests = Vec::new();
            for (status, body) in responses {
                let (stream, _) = listener.accept().expect("accept");
                let mut reader = BufReader::new(stream);
                let mut request_line = String::new();
                reader.read_line(&mut request_line).expect("request line");
                let mut content_length = 0usize;
                loop {
                    let mut header = String::new();
                    reader.read_line(&mut header).expect("header");
                    let header = header.trim_end();
                    if header.is_empty() {
                        break;
                    }
                    if let Some((name, value)) = header.split_once(':') {
                        if name.eq_ignore_ascii_case("content-length") {
                            content_length = value.trim().parse().expect("content length");
                        }
                    }
                }
                let mut request_body = vec![0; content_length];
                reader.read_exact(&mut request_body).expect("request body");
                requests.push(request_line.trim_end().to_string());

                let reason = match status {
                    200 => "OK",
                    404 => "Not Found",
                    _ => "Internal Server Error",
                };
                let mut stream = reader.into_inner();
                write!(
                    stream,
                    "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                )
                .expect("write response");
            }
            requests
        });
        (format!("http://{address}"), handle)
    }

    fn client(api_root: String) -> ConfluenceClient {
        ConfluenceClient::new(ConfluenceClientConfig {
            api_root,
            username: "bot@acme.test".to_string(),
            token: "secret".to_string(),
            user_agent: "ctag-test".to_string(),
            timeout_ms: 5_000,
        })
        .expect("client")
    }

    fn labels_body(names: impl Iterator<Item = String>) -> String {
        let results = names
            .map(|name| json!({"prefix": "global", "name": name}))
            .collect::<Vec<_>>();
        json!({ "results": results }).to_string()
    }

    #[test]
    fn removing_an_absent_label_succeeds() {
        let (root, server) = serve(vec![(404, "{}".to_string())]);
        let mut api = client(root);

        api.remove_page_label("42", "old").expect("404 is success");
        assert_eq!(api.request_count(), 1);
        let requests = server.join().expect("server");
        assert!(
            requests[0].starts_with("DELETE /content/42/label?name=old "),
            "{requests:?}"
        );
    }

    #[test]
    fn error_status_carries_trimmed_body() {
        let (root, server) = serve(vec![(500, "  upstream exploded  ".to_string())]);
        let mut api = client(root);

        let error = api
            .remove_page_label("42", "old")
            .expect_err("500 must fail");
        let message = format!("{error:#}");
        assert!(message.contains("HTTP 500"), "{message}");
        assert!(message.contains("HTTP 500 Internal Server Error: upstream exploded"));
        assert!(message.contains("failed to remove tag 'old' from page 42"));
        assert!(!message.contains("secret"));
        server.join().expect("server");
    }

    #[test]
    fn labels_are_read_until_a_short_page() {
        let first = labels_body((0..200).map(|index| format!("tag-{index}")));
        let second = labels_body((200..250).map(|index| format!("tag-{index}")));
        let (root, server) = serve(vec![(200, first), (200, second)]);
        let mut api = client(root);

        let labels = api.get_page_labels("7").expect("labels");
        assert_eq!(labels.len(), 250);
        assert_eq!(labels[0], "tag-0");
        assert_eq!(labels[249], "tag-249");
        assert_eq!(api.request_count(), 2);

        let requests = server.join().expect("server");
        assert_eq!(requests.len(), 2);
        assert!(requests[0].contains("/content/7/label?start=0&limit=200"));
        assert!(requests[1].contains("/content/7/label?start=200&limit=200"));
    }

    #[test]
    fn api_root_normalizes_site_urls() {
        assert_eq!(
            api_root("https://acme.atlassian.net"),
            "https://acme.atlassian.net/wiki/rest/api"
        );
        assert_eq!(
            api_root("https://acme.atlassian.net/"),
            "https://acme.atlassian.net/wiki/rest/api"
        );
        assert_eq!(
            api_root(" https://acme.atlassian.net/wiki/ "),
            "https://acme.atlassian.net/wiki/rest/api"
        );
    }

    #[test]
    fn search_results_accept_object_and_array_payloads() {
        let items = parse_search_results(json!({"results": [{"title": "A"}], "size": 1}))
            .expect("object payload");
        assert_eq!(items.len(), 1);

        let items = parse_search_results(json!([{"title": "A"}, {"title": "B"}]))
            .expect("array payload");
        assert_eq!(items.len(), 2);

        let items = parse_search_results(json!({"size": 0})).expect("missing results");
        assert!(items.is_empty());

        assert!(parse_search_results(json!("nope")).is_err());
    }

    #[test]
    fn labels_response_reads_names() {
        let parsed: LabelsResponse = serde_json::from_value(json!({
            "results": [
                {"prefix": "global", "name": "alpha", "id": "1"},
                {"prefix": "global", "name": "beta", "id": "2"}
            ],
            "size": 2
        }))
        .expect("labels");
        let names = parsed
            .results
            .into_iter()
            .map(|label| label.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["alpha", "beta"]);
    }
}
