//! Storage layer
//!
//! Exposes buckets of schema-governed rows on top of a CKAN DataStore.
//!
//! ## Caches
//!
//! - **Bucket list**: filled lazily by [`Storage::buckets`], dropped by any
//!   successful create or delete.
//! - **Descriptors**: filled by [`Storage::describe`] (explicitly or on first
//!   read), entries removed when their bucket is deleted.
//!
//! Both live on the `Storage` value, so two instances pointed at different
//! instances never share entries. Mutating calls take `&mut self`; sharing a
//! `Storage` across threads needs an external lock.
//!
//! Every response is checked for the DataStore's error envelope before it
//! is used. Nothing is retried.

pub mod error;
mod stream;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value as Json};
use tracing::{debug, info, warn};

use crate::config::{Config, DEFAULT_MAX_PAGES};
use crate::mapper::{self, Record, RemoteField};
use crate::schema::{Descriptor, Row};
use crate::transport::{Credential, HttpTransport, Request, Transport};

pub use error::{StorageError, StorageResult};
pub use stream::{PreparedWrite, RowIter, WriteStream};

/// Action API prefix, relative to the base URL
const ACTION_PATH: &str = "/api/3/action";

/// Pseudo-table listing every DataStore table
const METADATA_TABLE: &str = "_table_metadata";

/// Conflict policy used when none is given
pub const DEFAULT_WRITE_METHOD: &str = "upsert";

/// One bucket or a batch of them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    One(String),
    Many(Vec<String>),
}

impl Selection {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Selection::One(bucket) => vec![bucket],
            Selection::Many(buckets) => buckets,
        }
    }
}

impl From<&str> for Selection {
    fn from(bucket: &str) -> Self {
        Selection::One(bucket.to_string())
    }
}

impl From<String> for Selection {
    fn from(bucket: String) -> Self {
        Selection::One(bucket)
    }
}

impl From<Vec<String>> for Selection {
    fn from(buckets: Vec<String>) -> Self {
        Selection::Many(buckets)
    }
}

impl From<Vec<&str>> for Selection {
    fn from(buckets: Vec<&str>) -> Self {
        Selection::Many(buckets.into_iter().map(str::to_string).collect())
    }
}

impl From<&[&str]> for Selection {
    fn from(buckets: &[&str]) -> Self {
        Selection::Many(buckets.iter().map(|b| b.to_string()).collect())
    }
}

/// The `result` member of a `datastore_search` response
#[derive(Debug, Default, Deserialize)]
pub(crate) struct SearchPage {
    #[serde(default)]
    pub records: Vec<Record>,
    #[serde(default)]
    pub fields: Vec<RemoteField>,
    #[serde(default, rename = "_links")]
    pub links: Option<PageLinks>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct PageLinks {
    #[serde(default)]
    pub next: Option<String>,
}

impl SearchPage {
    /// Request for the following page; the link is relative to the base URL
    pub fn next_request(&self, base_url: &str) -> Option<Request> {
        self.links
            .as_ref()
            .and_then(|links| links.next.as_ref())
            .map(|next| Request::get(format!("{}{}", base_url, next)))
    }
}

/// Tabular storage backed by a CKAN DataStore
pub struct Storage<T: Transport> {
    base_url: String,
    endpoint: String,
    dataset_id: Option<String>,
    transport: T,
    bucket_cache: Option<Vec<String>>,
    descriptors: HashMap<String, Descriptor>,
    max_pages: usize,
}

impl Storage<HttpTransport> {
    /// Build a storage with an HTTP transport from configuration
    pub fn from_config(config: &Config) -> StorageResult<Self> {
        let credential = config.api_key.as_deref().map(Credential::parse);
        let transport =
            HttpTransport::new(credential, Duration::from_secs(config.timeout_secs))?;

        Ok(Storage::new(&config.base_url, config.dataset_id.clone(), transport)
            .with_max_pages(config.max_pages))
    }
}

impl<T: Transport> Storage<T> {
    /// Create a storage for the CKAN instance at `base_url`
    ///
    /// With a `dataset_id`, only that dataset's resources are listed as buckets.
    pub fn new(base_url: &str, dataset_id: Option<String>, transport: T) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            endpoint: format!("{}{}", base_url, ACTION_PATH),
            base_url,
            dataset_id,
            transport,
            bucket_cache: None,
            descriptors: HashMap::new(),
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    /// Cap the number of pages fetched when listing buckets
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn dataset_id(&self) -> Option<&str> {
        self.dataset_id.as_deref()
    }

    /// Drop the cached bucket list
    pub fn invalidate_cache(&mut self) {
        self.bucket_cache = None;
    }

    // ==================== Buckets ====================

    /// List bucket names, from cache when available
    ///
    /// Pages are followed until one comes back empty or `max_pages` requests
    /// have been made; hitting the bound truncates the list with a warning.
    pub fn buckets(&mut self) -> StorageResult<Vec<String>> {
        if let Some(ref cached) = self.bucket_cache {
            return Ok(cached.clone());
        }

        let mut request =
            Request::get(self.action_url("datastore_search")).param("resource_id", METADATA_TABLE);
        if let Some(dataset_id) = self.dataset_id.clone() {
            let resource_ids = self.resource_ids_for_dataset(&dataset_id)?;
            request = request.param("filters", json!({ "name": resource_ids }).to_string());
        }

        let mut page = self.fetch_page(request)?;
        let mut buckets = table_names(&page);
        let mut count = 1;

        while !page.records.is_empty() {
            if count >= self.max_pages {
                warn!(
                    "Max page count ({}) reached. {} buckets returned.",
                    self.max_pages,
                    buckets.len()
                );
                break;
            }
            let Some(next) = page.next_request(&self.base_url) else {
                debug!("Listing page has no next link; stopping");
                break;
            };
            count += 1;
            page = self.fetch_page(next)?;
            buckets.extend(table_names(&page));
        }

        debug!("Listed {} bucket(s) in {} page(s)", buckets.len(), count);
        self.bucket_cache = Some(buckets.clone());
        Ok(buckets)
    }

    /// Whether a bucket is in the (possibly cached) listing
    pub fn bucket_exists(&mut self, bucket: &str) -> StorageResult<bool> {
        Ok(self.buckets()?.iter().any(|b| b == bucket))
    }

    /// Create buckets, pairing buckets and descriptors by position
    ///
    /// Existing buckets are an error unless `force` is set, in which case
    /// they are deleted first.
    pub fn create(
        &mut self,
        buckets: impl Into<Selection>,
        descriptors: Vec<Descriptor>,
        force: bool,
    ) -> StorageResult<()> {
        let buckets = buckets.into().into_vec();
        if buckets.len() != descriptors.len() {
            return Err(StorageError::MismatchedBatch {
                buckets: buckets.len(),
                descriptors: descriptors.len(),
            });
        }

        let existing = self.buckets()?;
        for bucket in existing.iter().rev() {
            if buckets.contains(bucket) {
                if !force {
                    return Err(StorageError::BucketExists {
                        bucket: bucket.clone(),
                    });
                }
                self.delete(Some(Selection::One(bucket.clone())), false)?;
            }
        }

        let result = self.create_each(&buckets, descriptors);
        self.bucket_cache = None;
        result
    }

    fn create_each(&mut self, buckets: &[String], descriptors: Vec<Descriptor>) -> StorageResult<()> {
        for (bucket, descriptor) in buckets.iter().zip(descriptors) {
            descriptor.validate()?;
            let spec = mapper::descriptor_to_create_spec(&descriptor, bucket);
            self.descriptors.insert(bucket.clone(), descriptor);
            self.call(Request::post(self.action_url("datastore_create"), spec))?;
            info!("Created bucket {}", bucket);
        }
        Ok(())
    }

    /// Delete buckets; `None` deletes every bucket in reverse listing order
    ///
    /// With `ignore`, the first missing bucket ends the whole batch without
    /// error: buckets after it are left untouched.
    pub fn delete(&mut self, buckets: Option<Selection>, ignore: bool) -> StorageResult<()> {
        let targets = match buckets {
            Some(selection) => selection.into_vec(),
            None => {
                let mut all = self.buckets()?;
                all.reverse();
                all
            }
        };

        let mut deleted = 0;
        let result = self.delete_each(targets, ignore, &mut deleted);
        if deleted > 0 || result.is_ok() {
            self.bucket_cache = None;
        }
        result
    }

    fn delete_each(
        &mut self,
        targets: Vec<String>,
        ignore: bool,
        deleted: &mut usize,
    ) -> StorageResult<()> {
        for bucket in targets {
            if !self.bucket_exists(&bucket)? {
                if !ignore {
                    return Err(StorageError::BucketMissing { bucket });
                }
                debug!("Bucket {} is missing; ignoring the rest of the batch", bucket);
                return Ok(());
            }

            self.descriptors.remove(&bucket);
            self.call(Request::post(
                self.action_url("datastore_delete"),
                json!({ "resource_id": bucket, "force": true }),
            ))?;
            *deleted += 1;
            info!("Deleted bucket {}", bucket);
        }
        Ok(())
    }

    /// Get or set the descriptor of a bucket
    ///
    /// Without a descriptor, the cached one is returned, or one is derived
    /// from the DataStore's field list and cached.
    pub fn describe(
        &mut self,
        bucket: &str,
        descriptor: Option<Descriptor>,
    ) -> StorageResult<Descriptor> {
        if let Some(descriptor) = descriptor {
            self.descriptors
                .insert(bucket.to_string(), descriptor.clone());
            return Ok(descriptor);
        }

        if let Some(cached) = self.descriptors.get(bucket) {
            return Ok(cached.clone());
        }

        let page = self.fetch_page(
            Request::get(self.action_url("datastore_search"))
                .param("resource_id", bucket)
                .param("limit", "0"),
        )?;
        let descriptor = mapper::remote_fields_to_descriptor(&page.fields);
        self.descriptors
            .insert(bucket.to_string(), descriptor.clone());
        Ok(descriptor)
    }

    // ==================== Rows ====================

    /// Lazily iterate over the rows of a bucket
    pub fn iter(&mut self, bucket: &str) -> StorageResult<RowIter<'_, T>> {
        let descriptor = self.describe(bucket, None)?;
        let first = Request::get(self.action_url("datastore_search")).param("resource_id", bucket);
        Ok(RowIter::new(self, descriptor, first))
    }

    /// Read every row of a bucket
    pub fn read(&mut self, bucket: &str) -> StorageResult<Vec<Row>> {
        self.iter(bucket)?.collect()
    }

    /// Convert positional rows to records without sending them
    pub fn prepare_write<I>(&mut self, bucket: &str, rows: I) -> StorageResult<PreparedWrite>
    where
        I: IntoIterator,
        I::Item: AsRef<[Json]>,
    {
        let descriptor = self.describe(bucket, None)?;
        let records = rows
            .into_iter()
            .map(|row| mapper::uncast_row(row.as_ref(), &descriptor))
            .collect();

        Ok(PreparedWrite {
            bucket: bucket.to_string(),
            records,
        })
    }

    /// Send prepared records in a single `datastore_upsert` call
    ///
    /// `method` (`insert`, `upsert`, `update`) is passed through as is.
    pub fn commit(&self, prepared: PreparedWrite, method: &str) -> StorageResult<()> {
        let count = prepared.records.len();
        let records: Vec<Json> = prepared.records.into_iter().map(Json::Object).collect();
        let body = json!({
            "resource_id": prepared.bucket,
            "method": method,
            "force": true,
            "records": records,
        });

        self.call(Request::post(self.action_url("datastore_upsert"), body))?;
        info!("Wrote {} record(s) to {}", count, prepared.bucket);
        Ok(())
    }

    /// Convert and send rows in one go
    pub fn write<I>(&mut self, bucket: &str, rows: I, method: &str) -> StorageResult<()>
    where
        I: IntoIterator,
        I::Item: AsRef<[Json]>,
    {
        let prepared = self.prepare_write(bucket, rows)?;
        self.commit(prepared, method)
    }

    /// Write lazily: rows are handed back as they are converted and the
    /// upsert happens when the returned stream is drained
    pub fn write_stream<I>(
        &mut self,
        bucket: &str,
        rows: I,
        method: &str,
    ) -> StorageResult<WriteStream<'_, T, I::IntoIter>>
    where
        I: IntoIterator,
        I::Item: AsRef<[Json]>,
    {
        let descriptor = self.describe(bucket, None)?;
        Ok(WriteStream::new(
            self,
            descriptor,
            bucket,
            method,
            rows.into_iter(),
        ))
    }

    // ==================== Requests ====================

    fn action_url(&self, action: &str) -> String {
        format!("{}/{}", self.endpoint, action)
    }

    /// Execute a request and reject error envelopes
    fn call(&self, request: Request) -> StorageResult<Json> {
        let response = self.transport.request(&request)?;
        check_envelope(&response)?;
        Ok(response)
    }

    pub(crate) fn fetch_page(&self, request: Request) -> StorageResult<SearchPage> {
        let url = request.url.clone();
        let response = self.call(request)?;
        let result = take_result(response, &url)?;
        Ok(serde_json::from_value(result)?)
    }

    fn resource_ids_for_dataset(&self, dataset_id: &str) -> StorageResult<Vec<String>> {
        let url = self.action_url("package_show");
        let response = self.call(Request::get(&url).param("id", dataset_id))?;
        let result = take_result(response, &url)?;

        let resources = result
            .get("resources")
            .and_then(Json::as_array)
            .ok_or_else(|| StorageError::UnexpectedResponse {
                url: url.clone(),
                missing: "result.resources".to_string(),
            })?;

        Ok(resources
            .iter()
            .filter_map(|r| r.get("id").and_then(Json::as_str))
            .map(str::to_string)
            .collect())
    }
}

impl<T: Transport> fmt::Display for Storage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Storage <{}>", self.base_url)
    }
}

/// Turn a DataStore error envelope into an error
///
/// The action API reports logical failures in the body, not the status.
pub fn check_envelope(response: &Json) -> StorageResult<()> {
    if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
        return Err(StorageError::Remote {
            payload: error.to_string(),
        });
    }
    if response.get("success") == Some(&Json::Bool(false)) {
        return Err(StorageError::Remote {
            payload: response.to_string(),
        });
    }
    Ok(())
}

fn take_result(response: Json, url: &str) -> StorageResult<Json> {
    let result = match response {
        Json::Object(mut map) => map.remove("result"),
        _ => None,
    };
    result.ok_or_else(|| StorageError::UnexpectedResponse {
        url: url.to_string(),
        missing: "result".to_string(),
    })
}

fn table_names(page: &SearchPage) -> Vec<String> {
    page.records
        .iter()
        .filter_map(|r| r.get("name").and_then(Json::as_str))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Cell, Field, FieldType};
    use crate::transport::mock::MockTransport;
    use crate::transport::Method;
    use chrono::NaiveDate;

    const BASE: &str = "https://demo.ckan.org";
    const ARTICLES: &str = "79843e49-7974-411c-8eb5-fb2d1111d707";
    const COMMENTS: &str = "bd79c992-40f0-454a-a0ff-887f84a792fb";

    fn storage(mock: &MockTransport) -> Storage<&MockTransport> {
        Storage::new(BASE, Some("my-dataset-id".to_string()), mock)
    }

    fn unscoped(mock: &MockTransport) -> Storage<&MockTransport> {
        Storage::new(BASE, None, mock)
    }

    fn package_show() -> Json {
        json!({
            "success": true,
            "result": {
                "id": "my-dataset-id",
                "resources": [{"id": ARTICLES}, {"id": COMMENTS}]
            }
        })
    }

    fn metadata_page(names: &[&str], offset: usize) -> Json {
        let records: Vec<Json> = names
            .iter()
            .map(|name| json!({"_id": 1, "name": name, "oid": 1, "alias_of": null}))
            .collect();
        json!({
            "success": true,
            "result": {
                "resource_id": "_table_metadata",
                "records": records,
                "_links": {
                    "start": "/api/3/action/datastore_search?resource_id=_table_metadata",
                    "next": format!(
                        "/api/3/action/datastore_search?offset={}&resource_id=_table_metadata",
                        offset + 100
                    )
                }
            }
        })
    }

    /// package_show plus a two-page listing of both buckets
    fn listing(mock: &MockTransport) {
        mock.respond(package_show())
            .respond(metadata_page(&[COMMENTS, ARTICLES], 0))
            .respond(metadata_page(&[], 100));
    }

    fn ok() -> Json {
        json!({"success": true, "result": {}})
    }

    fn describe_response() -> Json {
        json!({
            "success": true,
            "result": {
                "resource_id": ARTICLES,
                "records": [],
                "fields": [
                    {"id": "_id", "type": "int"},
                    {"id": "id", "type": "int4"},
                    {"id": "name", "type": "text"},
                    {"id": "created", "type": "timestamp"}
                ],
                "limit": 0,
                "_links": {"start": "/api/3/action/datastore_search?limit=0&resource_id=x"}
            }
        })
    }

    fn sample_descriptor() -> Descriptor {
        Descriptor::new(vec![
            Field::new("id", FieldType::Integer),
            Field::new("name", FieldType::String),
            Field::new("created", FieldType::Datetime).with_format("any"),
        ])
    }

    #[test]
    fn test_display() {
        let mock = MockTransport::new();
        let storage = Storage::new("https://demo.ckan.org/", None, &mock);
        assert_eq!(storage.to_string(), "Storage <https://demo.ckan.org>");
    }

    #[test]
    fn test_buckets_paginates_and_caches() {
        let mock = MockTransport::new();
        mock.respond(package_show())
            .respond(metadata_page(&[COMMENTS], 0))
            .respond(metadata_page(&[ARTICLES], 100))
            .respond(metadata_page(&[], 200));
        let mut storage = storage(&mock);

        assert_eq!(storage.buckets().unwrap(), vec![COMMENTS, ARTICLES]);
        assert_eq!(mock.request_count(), 4);

        let requests = mock.requests();
        assert_eq!(requests[0].url, format!("{}/api/3/action/package_show", BASE));
        assert_eq!(requests[0].query_value("id"), Some("my-dataset-id"));
        assert_eq!(requests[1].query_value("resource_id"), Some("_table_metadata"));
        let filters: Json = serde_json::from_str(requests[1].query_value("filters").unwrap()).unwrap();
        assert_eq!(filters, json!({"name": [ARTICLES, COMMENTS]}));
        assert_eq!(
            requests[2].url,
            format!(
                "{}/api/3/action/datastore_search?offset=100&resource_id=_table_metadata",
                BASE
            )
        );

        // Calling again shouldn't make new requests
        assert_eq!(storage.buckets().unwrap(), vec![COMMENTS, ARTICLES]);
        assert_eq!(mock.request_count(), 4);
    }

    #[test]
    fn test_buckets_page_bound_truncates() {
        let mock = MockTransport::new();
        mock.respond(metadata_page(&["a"], 0))
            .respond(metadata_page(&["b"], 100))
            .respond(metadata_page(&["c"], 200));
        let mut storage = unscoped(&mock).with_max_pages(2);

        assert_eq!(storage.buckets().unwrap(), vec!["a", "b"]);
        assert_eq!(mock.request_count(), 2);
    }

    #[test]
    fn test_empty_listing_is_cached() {
        let mock = MockTransport::new();
        mock.respond(metadata_page(&[], 0));
        let mut storage = unscoped(&mock);

        assert!(storage.buckets().unwrap().is_empty());
        assert!(storage.buckets().unwrap().is_empty());
        assert_eq!(mock.request_count(), 1);
    }

    #[test]
    fn test_invalidate_cache_forces_relisting() {
        let mock = MockTransport::new();
        mock.respond(metadata_page(&["a"], 0))
            .respond(metadata_page(&[], 100))
            .respond(metadata_page(&["a", "b"], 0))
            .respond(metadata_page(&[], 100));
        let mut storage = unscoped(&mock);

        assert_eq!(storage.buckets().unwrap(), vec!["a"]);
        assert_eq!(storage.buckets().unwrap(), vec!["a"]);
        assert_eq!(mock.request_count(), 2);

        storage.invalidate_cache();
        assert_eq!(storage.buckets().unwrap(), vec!["a", "b"]);
        assert_eq!(mock.request_count(), 4);
    }

    #[test]
    fn test_remote_error_envelope() {
        let mock = MockTransport::new();
        mock.respond(json!({
            "success": false,
            "error": {"message": "Not found: Resource \"x\" was not found.", "__type": "Not Found Error"}
        }));
        let mut storage = unscoped(&mock);

        let err = storage.describe("x", None).unwrap_err();
        assert!(err.is_remote());
        assert!(err.to_string().contains("Not Found Error"));
    }

    #[test]
    fn test_check_envelope() {
        assert!(check_envelope(&json!({"success": true, "result": {}})).is_ok());
        assert!(check_envelope(&json!({"success": true, "error": null})).is_ok());
        assert!(check_envelope(&json!({"success": false})).is_err());
        assert!(check_envelope(&json!({"error": {"__type": "Validation Error"}})).is_err());
    }

    #[test]
    fn test_describe_derives_and_caches() {
        let mock = MockTransport::new();
        mock.respond(describe_response());
        let mut storage = storage(&mock);

        let descriptor = storage.describe(ARTICLES, None).unwrap();
        assert_eq!(descriptor, sample_descriptor());
        assert_eq!(
            serde_json::to_value(&descriptor).unwrap(),
            json!({
                "fields": [
                    {"name": "id", "type": "integer"},
                    {"name": "name", "type": "string"},
                    {"name": "created", "type": "datetime", "format": "any"}
                ]
            })
        );

        let request = &mock.requests()[0];
        assert_eq!(request.query_value("resource_id"), Some(ARTICLES));
        assert_eq!(request.query_value("limit"), Some("0"));

        storage.describe(ARTICLES, None).unwrap();
        assert_eq!(mock.request_count(), 1);
    }

    #[test]
    fn test_describe_with_descriptor_is_local() {
        let mock = MockTransport::new();
        let mut storage = storage(&mock);

        let descriptor = storage
            .describe("articles", Some(sample_descriptor()))
            .unwrap();
        assert_eq!(descriptor, sample_descriptor());
        assert_eq!(storage.describe("articles", None).unwrap(), sample_descriptor());
        assert_eq!(mock.request_count(), 0);
    }

    #[test]
    fn test_delete_single() {
        let mock = MockTransport::new();
        listing(&mock);
        mock.respond(ok());
        let mut storage = storage(&mock);

        storage.delete(Some(ARTICLES.into()), false).unwrap();

        let requests = mock.requests();
        assert_eq!(requests.len(), 4);
        assert_eq!(requests[3].url, format!("{}/api/3/action/datastore_delete", BASE));
        assert_eq!(requests[3].method, Method::Post);
        assert_eq!(
            requests[3].body,
            Some(json!({"resource_id": ARTICLES, "force": true}))
        );

        // Cache was invalidated
        mock.respond(package_show()).respond(metadata_page(&[], 0));
        storage.buckets().unwrap();
        assert_eq!(mock.request_count(), 6);
    }

    #[test]
    fn test_delete_missing_bucket() {
        let mock = MockTransport::new();
        listing(&mock);
        let mut storage = storage(&mock);

        let err = storage.delete(Some("non_existent".into()), false).unwrap_err();
        assert!(matches!(err, StorageError::BucketMissing { ref bucket } if bucket == "non_existent"));
        assert_eq!(mock.request_count(), 3);
    }

    #[test]
    fn test_delete_all_in_reverse_order() {
        let mock = MockTransport::new();
        listing(&mock);
        mock.respond(ok()).respond(ok());
        let mut storage = storage(&mock);

        storage.delete(None, false).unwrap();

        let requests = mock.requests();
        assert_eq!(requests.len(), 5);
        let deleted: Vec<&Json> = requests[3..]
            .iter()
            .map(|r| &r.body.as_ref().unwrap()["resource_id"])
            .collect();
        assert_eq!(deleted, vec![&json!(ARTICLES), &json!(COMMENTS)]);

        // Next listing goes back to the DataStore
        mock.respond(package_show()).respond(metadata_page(&[], 0));
        assert!(storage.buckets().unwrap().is_empty());
        assert_eq!(mock.request_count(), 7);
    }

    #[test]
    fn test_delete_ignore_stops_at_first_missing() {
        let mock = MockTransport::new();
        listing(&mock);
        mock.respond(ok());
        let mut storage = storage(&mock);

        // The missing bucket ends the batch: COMMENTS is not deleted
        storage
            .delete(Some(vec![ARTICLES, "non_existent", COMMENTS].into()), true)
            .unwrap();

        let requests = mock.requests();
        assert_eq!(requests.len(), 4);
        assert_eq!(requests[3].body.as_ref().unwrap()["resource_id"], ARTICLES);
    }

    #[test]
    fn test_delete_drops_cached_descriptor() {
        let mock = MockTransport::new();
        listing(&mock);
        mock.respond(ok()).respond(describe_response());
        let mut storage = storage(&mock);

        storage.describe(ARTICLES, Some(Descriptor::new(vec![Field::new("x", FieldType::String)])))
            .unwrap();
        storage.delete(Some(ARTICLES.into()), false).unwrap();

        // Descriptor comes from the DataStore again
        assert_eq!(storage.describe(ARTICLES, None).unwrap(), sample_descriptor());
        assert_eq!(mock.request_count(), 5);
    }

    #[test]
    fn test_create() {
        let mock = MockTransport::new();
        mock.respond(package_show())
            .respond(metadata_page(&[], 0))
            .respond(ok());
        let mut storage = storage(&mock);

        storage.create(ARTICLES, vec![sample_descriptor()], false).unwrap();

        let requests = mock.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[2].url, format!("{}/api/3/action/datastore_create", BASE));
        assert_eq!(
            requests[2].body,
            Some(json!({
                "fields": [
                    {"id": "id", "type": "int"},
                    {"id": "name", "type": "text"},
                    {"id": "created", "type": "timestamp"}
                ],
                "resource_id": ARTICLES,
                "force": true
            }))
        );

        // Descriptor cached locally, bucket list invalidated
        assert_eq!(storage.describe(ARTICLES, None).unwrap(), sample_descriptor());
        assert_eq!(mock.request_count(), 3);
        assert!(storage.bucket_cache.is_none());
    }

    #[test]
    fn test_create_existing_without_force() {
        let mock = MockTransport::new();
        listing(&mock);
        let mut storage = storage(&mock);

        let err = storage
            .create(
                vec![ARTICLES, COMMENTS],
                vec![sample_descriptor(), sample_descriptor()],
                false,
            )
            .unwrap_err();

        assert!(matches!(err, StorageError::BucketExists { .. }));
        assert!(mock
            .requests()
            .iter()
            .all(|r| !r.url.ends_with("datastore_create")));
    }

    #[test]
    fn test_create_force_replaces_existing() {
        let mock = MockTransport::new();
        mock.respond(metadata_page(&["a"], 0))
            .respond(metadata_page(&[], 100))
            .respond(ok())
            .respond(ok())
            .respond(ok());
        let mut storage = unscoped(&mock);

        storage
            .create(vec!["a", "b"], vec![sample_descriptor(), sample_descriptor()], true)
            .unwrap();

        let calls: Vec<(String, Json)> = mock.requests()[2..]
            .iter()
            .map(|r| {
                let action = r.url.rsplit('/').next().unwrap().to_string();
                (action, r.body.as_ref().unwrap()["resource_id"].clone())
            })
            .collect();
        assert_eq!(
            calls,
            vec![
                ("datastore_delete".to_string(), json!("a")),
                ("datastore_create".to_string(), json!("a")),
                ("datastore_create".to_string(), json!("b")),
            ]
        );
    }

    #[test]
    fn test_create_rejects_invalid_schema() {
        let mock = MockTransport::new();
        mock.respond(metadata_page(&[], 0));
        let mut storage = unscoped(&mock);

        let invalid = Descriptor::new(vec![
            Field::new("id", FieldType::Integer),
            Field::new("id", FieldType::Integer),
        ]);
        let err = storage.create("a", vec![invalid], false).unwrap_err();

        assert!(matches!(err, StorageError::InvalidSchema { .. }));
        assert_eq!(mock.request_count(), 1);
    }

    #[test]
    fn test_create_mismatched_batch() {
        let mock = MockTransport::new();
        let mut storage = unscoped(&mock);

        let err = storage
            .create(vec!["a", "b"], vec![sample_descriptor()], false)
            .unwrap_err();

        assert!(matches!(
            err,
            StorageError::MismatchedBatch {
                buckets: 2,
                descriptors: 1
            }
        ));
        assert_eq!(mock.request_count(), 0);
    }

    #[test]
    fn test_create_failure_midway_invalidates_listing() {
        let mock = MockTransport::new();
        mock.respond(metadata_page(&[], 0))
            .respond(ok())
            .respond(json!({
                "success": false,
                "error": {"__type": "Validation Error", "fields": ["invalid type"]}
            }))
            .respond(metadata_page(&["a"], 0))
            .respond(metadata_page(&[], 100));
        let mut storage = unscoped(&mock);

        let err = storage
            .create(vec!["a", "b"], vec![sample_descriptor(), sample_descriptor()], false)
            .unwrap_err();
        assert!(err.is_remote());
        assert_eq!(mock.request_count(), 3);

        // "a" was created, so the listing is fetched again
        assert_eq!(storage.buckets().unwrap(), vec!["a"]);
        assert_eq!(mock.request_count(), 5);
    }

    #[test]
    fn test_read_follows_pages() {
        let mock = MockTransport::new();
        mock.respond(describe_response())
            .respond(json!({
                "success": true,
                "result": {
                    "records": [
                        {"_id": 1, "id": 1, "name": "Taxes", "created": "2015-01-01T03:00:00"},
                        {"_id": 2, "id": 2, "name": "", "created": null}
                    ],
                    "_links": {"next": format!("/api/3/action/datastore_search?offset=100&resource_id={}", ARTICLES)}
                }
            }))
            .respond(json!({"success": true, "result": {"records": [], "_links": {}}}));
        let mut storage = storage(&mock);

        let rows = storage.read(ARTICLES).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], Cell::Integer(1));
        assert_eq!(rows[0]["name"], Cell::String("Taxes".to_string()));
        assert_eq!(
            rows[0]["created"],
            Cell::DateTime(NaiveDate::from_ymd_opt(2015, 1, 1).unwrap().and_hms_opt(3, 0, 0).unwrap())
        );
        assert_eq!(rows[1]["name"], Cell::Null);
        assert_eq!(rows[1]["created"], Cell::Null);

        let requests = mock.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[1].query_value("limit"), None);
        assert_eq!(
            requests[2].url,
            format!("{}/api/3/action/datastore_search?offset=100&resource_id={}", BASE, ARTICLES)
        );
    }

    #[test]
    fn test_read_casts_every_type() {
        let mock = MockTransport::new();
        mock.respond(json!({
            "success": true,
            "result": {
                "records": [{
                    "_id": 1,
                    "id": 1,
                    "name": "Taxes",
                    "current": true,
                    "rating": "9.5",
                    "created_year": 2015,
                    "created_date": "2015-01-01T00:00:00",
                    "created_time": "03:00:00",
                    "created_datetime": "2015-01-01T03:00:00",
                    "span": "P1DT2H",
                    "stats": {"chars": 560},
                    "persons": ["mike", "alice"],
                    "location": {"type": "Point", "coordinates": [50.8, -1.2]}
                }],
                "_links": {"next": "/api/3/action/datastore_search?offset=100"}
            }
        }))
        .respond(json!({"success": true, "result": {"records": []}}));
        let mut storage = unscoped(&mock);

        let descriptor = Descriptor::new(vec![
            Field::new("id", FieldType::Integer),
            Field::new("name", FieldType::String),
            Field::new("current", FieldType::Boolean),
            Field::new("rating", FieldType::Number),
            Field::new("created_year", FieldType::Year),
            Field::new("created_date", FieldType::Date).with_format("any"),
            Field::new("created_time", FieldType::Time).with_format("any"),
            Field::new("created_datetime", FieldType::Datetime).with_format("any"),
            Field::new("span", FieldType::Duration),
            Field::new("stats", FieldType::Object),
            Field::new("persons", FieldType::Array),
            Field::new("location", FieldType::Geojson),
        ]);
        storage.describe(ARTICLES, Some(descriptor)).unwrap();

        let rows = storage.read(ARTICLES).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        let date = NaiveDate::from_ymd_opt(2015, 1, 1).unwrap();

        assert_eq!(row["id"], Cell::Integer(1));
        assert_eq!(row["name"], Cell::String("Taxes".to_string()));
        assert_eq!(row["current"], Cell::Boolean(true));
        assert_eq!(row["rating"], Cell::Number(rust_decimal::Decimal::new(95, 1)));
        assert_eq!(row["created_year"], Cell::Year(2015));
        assert_eq!(row["created_date"], Cell::Date(date));
        assert_eq!(
            row["created_time"],
            Cell::Time(chrono::NaiveTime::from_hms_opt(3, 0, 0).unwrap())
        );
        assert_eq!(
            row["created_datetime"],
            Cell::DateTime(date.and_hms_opt(3, 0, 0).unwrap())
        );
        assert_eq!(row["span"], Cell::Duration("P1DT2H".to_string()));
        assert_eq!(row["stats"].to_json(), json!({"chars": 560}));
        assert_eq!(row["persons"], Cell::Array(vec![json!("mike"), json!("alice")]));
        assert_eq!(
            row["location"].to_json(),
            json!({"type": "Point", "coordinates": [50.8, -1.2]})
        );
        assert!(!row.contains_key("_id"));
        assert_eq!(mock.request_count(), 2);
    }

    #[test]
    fn test_iter_is_lazy() {
        let mock = MockTransport::new();
        mock.respond(describe_response())
            .respond(json!({
                "success": true,
                "result": {
                    "records": [{"id": 1, "name": "a", "created": null}],
                    "_links": {"next": "/api/3/action/datastore_search?offset=100"}
                }
            }));
        let mut storage = storage(&mock);

        let mut rows = storage.iter(ARTICLES).unwrap();
        assert_eq!(mock.request_count(), 1);

        assert!(rows.next().unwrap().is_ok());
        assert_eq!(mock.request_count(), 2);
        // Dropped before the next page is fetched
    }

    #[test]
    fn test_read_cast_error_aborts() {
        let mock = MockTransport::new();
        mock.respond(describe_response()).respond(json!({
            "success": true,
            "result": {"records": [{"id": "one", "name": "a", "created": null}]}
        }));
        let mut storage = storage(&mock);

        let err = storage.read(ARTICLES).unwrap_err();
        assert!(matches!(err, StorageError::Cast { ref field, .. } if field == "id"));
    }

    #[test]
    fn test_write_uncasts_rows() {
        let mock = MockTransport::new();
        mock.respond(describe_response()).respond(ok());
        let mut storage = storage(&mock);

        let rows = vec![vec![json!("1"), json!("Alice"), json!("")]];
        storage.write(ARTICLES, rows, DEFAULT_WRITE_METHOD).unwrap();

        let requests = mock.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].url, format!("{}/api/3/action/datastore_upsert", BASE));
        assert_eq!(
            requests[1].body,
            Some(json!({
                "resource_id": ARTICLES,
                "method": "upsert",
                "force": true,
                "records": [{"id": "1", "name": "Alice", "created": null}]
            }))
        );
    }

    #[test]
    fn test_prepare_write_sends_nothing() {
        let mock = MockTransport::new();
        let mut storage = storage(&mock);
        storage.describe("articles", Some(sample_descriptor())).unwrap();

        let prepared = storage
            .prepare_write("articles", [[json!(1), json!("a"), json!("")]])
            .unwrap();
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared.records()[0]["created"], Json::Null);
        assert_eq!(mock.request_count(), 0);
    }

    #[test]
    fn test_write_stream_commits_when_drained() {
        let mock = MockTransport::new();
        mock.respond(ok());
        let mut storage = storage(&mock);
        storage.describe("articles", Some(sample_descriptor())).unwrap();

        let rows = vec![
            vec![json!("1"), json!("Alice"), json!("")],
            vec![json!("2"), json!("Bob"), json!("2015-01-01T03:00:00")],
        ];
        let mut stream = storage.write_stream("articles", rows.clone(), "insert").unwrap();

        let first = stream.next().unwrap().unwrap();
        assert_eq!(first, rows[0]);
        assert_eq!(stream.converted().len(), 1);
        assert_eq!(mock.request_count(), 0);

        assert_eq!(stream.next().unwrap().unwrap(), rows[1]);
        assert!(stream.next().is_none());
        assert!(stream.is_finished());
        assert!(stream.next().is_none());

        let requests = mock.requests();
        assert_eq!(requests.len(), 1);
        let body = requests[0].body.as_ref().unwrap();
        assert_eq!(body["method"], "insert");
        assert_eq!(body["records"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_write_stream_surfaces_commit_error() {
        let mock = MockTransport::new();
        mock.respond(json!({"success": false, "error": {"__type": "Validation Error"}}));
        let mut storage = storage(&mock);
        storage.describe("articles", Some(sample_descriptor())).unwrap();

        let results: Vec<_> = storage
            .write_stream("articles", vec![vec![json!("1")]], DEFAULT_WRITE_METHOD)
            .unwrap()
            .collect();

        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(StorageError::Remote { .. })));
    }
}
