//! HTTP object store.
//!
//! Speaks the minimal protocol of a plain blob server:
//!
//! - `GET <base>/<name>`: the blob, or 404
//! - `PUT <base>/<name>`: create or replace
//! - `DELETE <base>/<name>`
//! - `GET <base>?prefix=<prefix>`: JSON array of matching names
//!
//! There are no timeouts; transport errors surface as build failures.

use reqwest::StatusCode;
use reqwest::blocking::Client;
use tracing::trace;

use super::CacheError;
use super::store::BlobStore;

#[derive(Debug, Clone)]
pub struct HttpStore {
  base: String,
  client: Client,
}

impl HttpStore {
  pub fn new(base: &str) -> Result<Self, CacheError> {
    let client = Client::builder()
      .timeout(None)
      .build()
      .map_err(|e| remote_err(base, e))?;
    Ok(Self {
      base: base.trim_end_matches('/').to_string(),
      client,
    })
  }

  fn url(&self, name: &str) -> String {
    format!("{}/{}", self.base, name)
  }
}

fn remote_err(name: &str, e: impl std::fmt::Display) -> CacheError {
  CacheError::Remote {
    name: name.to_string(),
    message: e.to_string(),
  }
}

impl BlobStore for HttpStore {
  fn read(&self, name: &str) -> Result<Option<Vec<u8>>, CacheError> {
    trace!(name, "GET");
    let response = self.client.get(self.url(name)).send().map_err(|e| remote_err(name, e))?;
    if response.status() == StatusCode::NOT_FOUND {
      return Ok(None);
    }
    let response = response.error_for_status().map_err(|e| remote_err(name, e))?;
    let bytes = response.bytes().map_err(|e| remote_err(name, e))?;
    Ok(Some(bytes.to_vec()))
  }

  fn write(&self, name: &str, bytes: &[u8]) -> Result<(), CacheError> {
    trace!(name, len = bytes.len(), "PUT");
    self
      .client
      .put(self.url(name))
      .body(bytes.to_vec())
      .send()
      .and_then(|r| r.error_for_status())
      .map_err(|e| remote_err(name, e))?;
    Ok(())
  }

  fn list(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
    trace!(prefix, "LIST");
    let response = self
      .client
      .get(&self.base)
      .query(&[("prefix", prefix)])
      .send()
      .and_then(|r| r.error_for_status())
      .map_err(|e| remote_err(prefix, e))?;
    let body = response.bytes().map_err(|e| remote_err(prefix, e))?;
    serde_json::from_slice(&body).map_err(|e| CacheError::Corrupt {
      name: prefix.to_string(),
      message: format!("invalid listing: {e}"),
    })
  }

  fn delete(&self, name: &str) -> Result<(), CacheError> {
    trace!(name, "DELETE");
    let response = self
      .client
      .delete(self.url(name))
      .send()
      .map_err(|e| remote_err(name, e))?;
    if response.status() == StatusCode::NOT_FOUND {
      return Ok(());
    }
    response.error_for_status().map_err(|e| remote_err(name, e))?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use mockito::{Matcher, Server};

  use super::*;

  fn store(server: &Server) -> HttpStore {
    HttpStore::new(&format!("{}/cache/", server.url())).unwrap()
  }

  #[test]
  fn urls_join_base_and_name() {
    let store = HttpStore::new("http://cache.internal:8080/builds/").unwrap();
    assert_eq!(
      store.url("abc/def.files"),
      "http://cache.internal:8080/builds/abc/def.files"
    );
  }

  #[test]
  fn read_found_and_not_found() {
    let mut server = Server::new();
    let found = server.mock("GET", "/cache/k/a").with_body("blob").create();
    let missing = server.mock("GET", "/cache/k/b").with_status(404).create();

    let store = store(&server);
    assert_eq!(store.read("k/a").unwrap().as_deref(), Some(&b"blob"[..]));
    assert_eq!(store.read("k/b").unwrap(), None);
    found.assert();
    missing.assert();
  }

  #[test]
  fn read_server_error_is_remote_error() {
    let mut server = Server::new();
    server.mock("GET", "/cache/k/a").with_status(500).create();
    let err = store(&server).read("k/a").unwrap_err();
    assert!(matches!(err, CacheError::Remote { ref name, .. } if name == "k/a"));
  }

  #[test]
  fn write_puts_the_bytes() {
    let mut server = Server::new();
    let put = server
      .mock("PUT", "/cache/memo/s/t")
      .match_body("value")
      .with_status(201)
      .create();
    store(&server).write("memo/s/t", b"value").unwrap();
    put.assert();
  }

  #[test]
  fn delete_of_absent_blob_succeeds() {
    let mut server = Server::new();
    let gone = server.mock("DELETE", "/cache/k/a").with_status(404).create();
    let broken = server.mock("DELETE", "/cache/k/b").with_status(503).create();

    let store = store(&server);
    store.delete("k/a").unwrap();
    assert!(store.delete("k/b").is_err());
    gone.assert();
    broken.assert();
  }

  #[test]
  fn list_sends_the_prefix_and_parses_names() {
    let mut server = Server::new();
    let listing = server
      .mock("GET", "/cache")
      .match_query(Matcher::UrlEncoded("prefix".into(), "k/".into()))
      .with_header("content-type", "application/json")
      .with_body(r#"["k/a", "k/b.files"]"#)
      .create();

    assert_eq!(store(&server).list("k/").unwrap(), vec!["k/a", "k/b.files"]);
    listing.assert();
  }

  #[test]
  fn list_rejects_a_malformed_listing() {
    let mut server = Server::new();
    server
      .mock("GET", "/cache")
      .match_query(Matcher::Any)
      .with_body("<html>")
      .create();
    let err = store(&server).list("k/").unwrap_err();
    assert!(matches!(err, CacheError::Corrupt { .. }));
  }
}
