//! Google Drive v3 client: recursive folder listing and downloads.
//!
//! Authentication is out of scope; the client sends a pre-issued bearer token when one is
//! configured.

use super::{ItemStream, SourceError};
use crate::model::{SourceRef, WorkItem};
use async_stream::try_stream;
use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;
use std::collections::VecDeque;

const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const PAGE_SIZE: &str = "1000";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    size: Option<String>,
}

/// HTTP client for the remote storage API.
pub struct DriveClient {
    http: Client,
    base_url: String,
    access_token: Option<String>,
}

impl DriveClient {
    /// Build a client for `base_url` (normally `https://www.googleapis.com`).
    pub fn new(
        base_url: impl Into<String>,
        access_token: Option<String>,
    ) -> Result<Self, reqwest::Error> {
        let http = Client::builder().user_agent("rusty-brief/0.1").build()?;
        let base_url = base_url.into();
        tracing::debug!(
            url = %base_url,
            has_token = access_token.is_some(),
            "Initialized storage HTTP client"
        );
        Ok(Self {
            http,
            base_url,
            access_token,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format_endpoint(&self.base_url, path));
        match self.access_token.as_deref() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Lazily list every file below `folder_id`, descending into sub-folders breadth-first.
    ///
    /// Items carry their folder path relative to the listed root.
    pub fn list_folder<'a>(&'a self, folder_id: &'a str) -> ItemStream<'a> {
        Box::pin(try_stream! {
            let mut folders: VecDeque<(String, Option<String>)> = VecDeque::new();
            folders.push_back((folder_id.to_string(), None));

            while let Some((current, prefix)) = folders.pop_front() {
                let mut page_token: Option<String> = None;
                loop {
                    let page = self.list_page(&current, page_token.as_deref()).await?;
                    for file in page.files {
                        let path = match &prefix {
                            Some(prefix) => format!("{prefix}/{}", file.name),
                            None => file.name.clone(),
                        };
                        if file.mime_type.as_deref() == Some(FOLDER_MIME_TYPE) {
                            folders.push_back((file.id, Some(path)));
                            continue;
                        }
                        yield WorkItem {
                            size: file
                                .size
                                .as_deref()
                                .and_then(|size| size.parse().ok())
                                .unwrap_or_default(),
                            source: SourceRef::Remote {
                                file_id: file.id.clone(),
                            },
                            id: file.id,
                            name: file.name,
                            path: Some(path),
                            content_type: file.mime_type,
                        };
                    }
                    match page.next_page_token {
                        Some(next) => page_token = Some(next),
                        None => break,
                    }
                }
            }
        })
    }

    async fn list_page(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<FileList, SourceError> {
        let query = format!("'{}' in parents and trashed=false", folder_id.replace('\'', "\\'"));
        let mut params = vec![
            ("q", query.as_str()),
            ("fields", "nextPageToken, files(id, name, mimeType, size)"),
            ("pageSize", PAGE_SIZE),
            ("supportsAllDrives", "true"),
            ("includeItemsFromAllDrives", "true"),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }

        let response = self
            .request(Method::GET, "drive/v3/files")
            .query(&params)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(folder_id, status = %status, "Failed to list folder");
            return Err(SourceError::UnexpectedStatus { status, body });
        }
        Ok(response.json().await?)
    }

    /// Download the contents of `file_id`.
    pub async fn download(&self, file_id: &str) -> Result<Vec<u8>, SourceError> {
        let response = self
            .request(Method::GET, &format!("drive/v3/files/{file_id}"))
            .query(&[("alt", "media"), ("supportsAllDrives", "true")])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::UnexpectedStatus { status, body });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Accept either a bare folder id or a folder URL such as
/// `https://drive.google.com/drive/folders/<id>?usp=sharing`.
pub fn extract_folder_id(input: &str) -> String {
    let trimmed = input.trim();
    match trimmed.split_once("folders/") {
        Some((_, rest)) => rest
            .split(['?', '/', '#'])
            .next()
            .unwrap_or(rest)
            .to_string(),
        None => trimmed.to_string(),
    }
}

fn format_endpoint(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;
    use httpmock::{Method::GET, MockServer};
    use serde_json::json;

    #[test]
    fn folder_ids_are_extracted_from_urls() {
        assert_eq!(
            extract_folder_id("https://drive.google.com/drive/folders/1AbC_d-9?usp=sharing"),
            "1AbC_d-9"
        );
        assert_eq!(extract_folder_id(" 1AbC "), "1AbC");
    }

    #[tokio::test]
    async fn lists_nested_folders() {
        let server = MockServer::start_async().await;
        let root = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/drive/v3/files")
                    .query_param("q", "'root' in parents and trashed=false")
                    .query_param("supportsAllDrives", "true")
                    .header("authorization", "Bearer token");
                then.status(200).json_body(json!({
                    "files": [
                        { "id": "f1", "name": "a.pdf", "mimeType": "application/pdf", "size": "10" },
                        { "id": "sub", "name": "Contracts", "mimeType": FOLDER_MIME_TYPE },
                        { "id": "f2", "name": "b.zip", "mimeType": "application/zip" }
                    ]
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/drive/v3/files")
                    .query_param("q", "'sub' in parents and trashed=false");
                then.status(200).json_body(json!({
                    "files": [ { "id": "f3", "name": "c.txt", "mimeType": "text/plain", "size": "3" } ]
                }));
            })
            .await;

        let client = DriveClient::new(server.base_url(), Some("token".into())).unwrap();
        let items: Vec<WorkItem> = client.list_folder("root").try_collect().await.unwrap();

        root.assert_async().await;
        let paths: Vec<_> = items.iter().map(|item| item.path.as_deref().unwrap()).collect();
        assert_eq!(paths, vec!["a.pdf", "b.zip", "Contracts/c.txt"]);
        assert_eq!(items[0].size, 10);
        assert_eq!(items[1].size, 0);
        assert_eq!(items[2].content_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn follows_page_tokens() {
        let server = MockServer::start_async().await;
        let second = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/drive/v3/files")
                    .query_param("q", "'paged' in parents and trashed=false")
                    .query_param("pageToken", "p2");
                then.status(200).json_body(json!({
                    "files": [ { "id": "f2", "name": "second.pdf" } ]
                }));
            })
            .await;
        let client = DriveClient::new(server.base_url(), None).unwrap();

        let page = client.list_page("paged", Some("p2")).await.unwrap();

        second.assert_async().await;
        assert!(page.next_page_token.is_none());
        assert_eq!(page.files[0].name, "second.pdf");
    }

    #[tokio::test]
    async fn listing_errors_surface_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/drive/v3/files");
                then.status(403).body("forbidden");
            })
            .await;

        let client = DriveClient::new(server.base_url(), None).unwrap();
        let result: Result<Vec<WorkItem>, SourceError> =
            client.list_folder("root").try_collect().await;
        assert!(matches!(
            result,
            Err(SourceError::UnexpectedStatus { status, .. }) if status.as_u16() == 403
        ));
    }

    #[tokio::test]
    async fn downloads_media() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/drive/v3/files/f1")
                    .query_param("alt", "media");
                then.status(200).body("%PDF-1.4");
            })
            .await;

        let client = DriveClient::new(server.base_url(), None).unwrap();
        assert_eq!(client.download("f1").await.unwrap(), b"%PDF-1.4");
    }
}
