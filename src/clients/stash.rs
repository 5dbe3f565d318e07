//! Metadata store over the Stash GraphQL API.

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::MetadataStore;
use crate::error::{PipelineError, Result};
use crate::models::media::{
    Gallery, ItemFilter, MediaItem, MediaKind, NewPerformer, Paged, Performer, PerformerFilter, SpritePaths,
};

const SERVICE: &str = "stash";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionCookie {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Value", default)]
    pub value: String,
}

/// Connection details handed to the plugin by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConnection {
    #[serde(rename = "Scheme", default = "default_scheme")]
    pub scheme: String,
    #[serde(rename = "Host", default = "default_host")]
    pub host: String,
    #[serde(rename = "Port", default = "default_port")]
    pub port: u16,
    #[serde(rename = "SessionCookie", default)]
    pub session_cookie: Option<SessionCookie>,
}

fn default_scheme() -> String {
    "http".to_string()
}
fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    9999
}

impl Default for ServerConnection {
    fn default() -> Self {
        Self { scheme: default_scheme(), host: default_host(), port: default_port(), session_cookie: None }
    }
}

impl ServerConnection {
    /// Base URL for reaching the host from this process.
    pub fn base_url(&self) -> String {
        let host = match self.host.as_str() {
            "" | "0.0.0.0" => "localhost",
            h => h,
        };
        format!("{}://{}:{}", self.scheme, host, self.port)
    }

    pub fn graphql_url(&self) -> String {
        format!("{}/graphql", self.base_url())
    }

    fn cookie_header(&self) -> Option<String> {
        self.session_cookie
            .as_ref()
            .filter(|c| !c.name.is_empty())
            .map(|c| format!("{}={}", c.name, c.value))
    }
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Default, Deserialize)]
struct IdRef {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct FileRef {
    path: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ScenePaths {
    sprite: Option<String>,
    vtt: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ItemData {
    id: String,
    files: Vec<FileRef>,
    performers: Vec<IdRef>,
    tags: Vec<IdRef>,
    paths: Option<ScenePaths>,
}

impl ItemData {
    fn into_item(self, kind: MediaKind) -> MediaItem {
        let sprite = match (kind, self.paths) {
            (MediaKind::Scene, Some(p)) => SpritePaths { sprite: p.sprite, vtt: p.vtt },
            _ => SpritePaths::default(),
        };
        MediaItem {
            id: self.id,
            kind,
            files: self.files.into_iter().map(|f| f.path).collect(),
            performer_ids: self.performers.into_iter().map(|p| p.id).collect(),
            label_ids: self.tags.into_iter().map(|t| t.id).collect(),
            sprite,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PerformerData {
    id: String,
    name: String,
    alias_list: Vec<String>,
    image_path: Option<String>,
    tags: Vec<IdRef>,
}

impl From<PerformerData> for Performer {
    fn from(p: PerformerData) -> Self {
        Performer {
            id: p.id,
            name: p.name,
            alias_list: p.alias_list,
            image_path: p.image_path,
            label_ids: p.tags.into_iter().map(|t| t.id).collect(),
        }
    }
}

const ITEM_FIELDS: &str = "id files { path } performers { id } tags { id }";
const SCENE_FIELDS: &str = "id files { path } performers { id } tags { id } paths { sprite vtt }";
const PERFORMER_FIELDS: &str = "id name alias_list image_path tags { id }";

struct KindQueries {
    find_many: &'static str,
    list_field: &'static str,
    filter_arg: &'static str,
    filter_type: &'static str,
    find_one: &'static str,
    update: &'static str,
    update_input: &'static str,
    fields: &'static str,
}

fn queries(kind: MediaKind) -> KindQueries {
    match kind {
        MediaKind::Image => KindQueries {
            find_many: "findImages",
            list_field: "images",
            filter_arg: "image_filter",
            filter_type: "ImageFilterType",
            find_one: "findImage",
            update: "imageUpdate",
            update_input: "ImageUpdateInput",
            fields: ITEM_FIELDS,
        },
        MediaKind::Scene => KindQueries {
            find_many: "findScenes",
            list_field: "scenes",
            filter_arg: "scene_filter",
            filter_type: "SceneFilterType",
            find_one: "findScene",
            update: "sceneUpdate",
            update_input: "SceneUpdateInput",
            fields: SCENE_FIELDS,
        },
    }
}

/// Label criteria in the host's filter dialect.
pub fn item_filter_json(filter: &ItemFilter) -> Value {
    let mut out = serde_json::Map::new();
    match (filter.include_labels.is_empty(), filter.exclude_labels.is_empty()) {
        (true, true) => {}
        (true, false) => {
            out.insert("tags".into(), json!({ "value": filter.exclude_labels, "modifier": "EXCLUDES" }));
        }
        (false, true) => {
            out.insert("tags".into(), json!({ "value": filter.include_labels, "modifier": "INCLUDES_ALL" }));
        }
        (false, false) => {
            out.insert(
                "tags".into(),
                json!({ "value": filter.include_labels, "modifier": "INCLUDES_ALL", "excludes": filter.exclude_labels }),
            );
        }
    }
    if let Some(gallery) = &filter.gallery {
        out.insert("galleries".into(), json!({ "value": [gallery], "modifier": "INCLUDES" }));
    }
    Value::Object(out)
}

pub fn performer_filter_json(filter: &PerformerFilter) -> Value {
    let mut out = serde_json::Map::new();
    if !filter.exclude_labels.is_empty() {
        out.insert("tags".into(), json!({ "value": filter.exclude_labels, "modifier": "EXCLUDES" }));
    }
    if filter.require_image {
        out.insert("NOT".into(), json!({ "is_missing": "image" }));
    }
    Value::Object(out)
}

fn gender_enum(gender: &str) -> Option<&'static str> {
    match gender.trim().to_ascii_lowercase().as_str() {
        "male" | "m" => Some("MALE"),
        "female" | "f" => Some("FEMALE"),
        _ => None,
    }
}

pub struct StashClient {
    connection: ServerConnection,
    http: Client,
}

impl StashClient {
    pub fn new(connection: ServerConnection) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(cookie) = connection.cookie_header() {
            let value = HeaderValue::from_str(&cookie)
                .map_err(|e| PipelineError::Configuration(format!("invalid session cookie: {}", e)))?;
            headers.insert(COOKIE, value);
        }
        let http = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| PipelineError::Configuration(format!("failed to build stash HTTP client: {}", e)))?;
        Ok(Self { connection, http })
    }

    pub fn connection(&self) -> &ServerConnection {
        &self.connection
    }

    pub fn query<T: DeserializeOwned>(&self, query: &str, variables: Value) -> Result<T> {
        let resp = self
            .http
            .post(self.connection.graphql_url())
            .json(&json!({ "query": query, "variables": variables }))
            .send()?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(PipelineError::transient(SERVICE, format!("GraphQL status {}: {}", status.as_u16(), body.trim())));
        }
        let parsed: GraphQlResponse<T> = resp.json()?;
        if !parsed.errors.is_empty() {
            let messages: Vec<&str> = parsed.errors.iter().map(|e| e.message.as_str()).collect();
            return Err(PipelineError::transient(SERVICE, messages.join("; ")));
        }
        parsed.data.ok_or_else(|| PipelineError::transient(SERVICE, "GraphQL response carried no data"))
    }

    /// The plugin's settings map as stored by the host, or an empty object.
    pub fn plugin_settings(&self, plugin_id: &str) -> Result<Value> {
        let data: Value = self.query("query { configuration { plugins } }", json!({}))?;
        let settings = data
            .pointer(&format!("/configuration/plugins/{}", plugin_id))
            .cloned()
            .unwrap_or_else(|| json!({}));
        Ok(settings)
    }

    fn update_item(&self, kind: MediaKind, item_id: &str, input: Value) -> Result<()> {
        let q = queries(kind);
        let mut input = input;
        input["id"] = json!(item_id);
        let query = format!("mutation($input: {}!) {{ {}(input: $input) {{ id }} }}", q.update_input, q.update);
        let _: Value = self.query(&query, json!({ "input": input }))?;
        Ok(())
    }

    fn update_performer(&self, performer_id: &str, input: Value) -> Result<()> {
        let mut input = input;
        input["id"] = json!(performer_id);
        let _: Value = self.query(
            "mutation($input: PerformerUpdateInput!) { performerUpdate(input: $input) { id } }",
            json!({ "input": input }),
        )?;
        Ok(())
    }

    fn get_performer(&self, performer_id: &str) -> Result<Performer> {
        let query = format!("query($id: ID!) {{ findPerformer(id: $id) {{ {} }} }}", PERFORMER_FIELDS);
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "findPerformer")]
            performer: Option<PerformerData>,
        }
        let data: Data = self.query(&query, json!({ "id": performer_id }))?;
        data.performer
            .map(Performer::from)
            .ok_or_else(|| PipelineError::NotFound(format!("performer {}", performer_id)))
    }
}

impl MetadataStore for StashClient {
    fn find_items(&self, kind: MediaKind, filter: &ItemFilter, page: usize, per_page: i64) -> Result<Paged<MediaItem>> {
        let q = queries(kind);
        let query = format!(
            "query($filter: FindFilterType, $item_filter: {ft}) {{ {fm}(filter: $filter, {fa}: $item_filter) {{ count {lf} {{ {fields} }} }} }}",
            ft = q.filter_type,
            fm = q.find_many,
            fa = q.filter_arg,
            lf = q.list_field,
            fields = q.fields,
        );
        let variables = json!({
            "filter": { "page": page.max(1), "per_page": per_page },
            "item_filter": item_filter_json(filter),
        });
        let data: Value = self.query(&query, variables)?;
        let block = data.get(q.find_many).cloned().unwrap_or(Value::Null);
        let total = block.get("count").and_then(Value::as_u64).unwrap_or(0) as usize;
        let items: Vec<ItemData> = match block.get(q.list_field) {
            Some(list) => serde_json::from_value(list.clone())?,
            None => Vec::new(),
        };
        debug!("{} page {} returned {} {}(s) of {}", q.find_many, page, items.len(), kind, total);
        Ok(Paged { total, items: items.into_iter().map(|i| i.into_item(kind)).collect() })
    }

    fn get_item(&self, kind: MediaKind, id: &str) -> Result<MediaItem> {
        let q = queries(kind);
        let query = format!("query($id: ID!) {{ {}(id: $id) {{ {} }} }}", q.find_one, q.fields);
        let data: Value = self.query(&query, json!({ "id": id }))?;
        match data.get(q.find_one) {
            Some(v) if !v.is_null() => {
                let item: ItemData = serde_json::from_value(v.clone())?;
                Ok(item.into_item(kind))
            }
            _ => Err(PipelineError::NotFound(format!("{} {}", kind, id))),
        }
    }

    fn add_label(&self, kind: MediaKind, item_id: &str, label_id: &str) -> Result<()> {
        let item = self.get_item(kind, item_id)?;
        if item.has_label(label_id) {
            return Ok(());
        }
        let mut ids = item.label_ids;
        ids.push(label_id.to_string());
        self.update_item(kind, item_id, json!({ "tag_ids": ids }))
    }

    fn remove_label(&self, kind: MediaKind, item_id: &str, label_id: &str) -> Result<()> {
        let item = self.get_item(kind, item_id)?;
        if !item.has_label(label_id) {
            return Ok(());
        }
        let ids: Vec<String> = item.label_ids.into_iter().filter(|l| l != label_id).collect();
        self.update_item(kind, item_id, json!({ "tag_ids": ids }))
    }

    fn set_performers(&self, kind: MediaKind, item_id: &str, performer_ids: &[String]) -> Result<()> {
        self.update_item(kind, item_id, json!({ "performer_ids": performer_ids }))
    }

    fn find_label(&self, name: &str) -> Result<Option<String>> {
        #[derive(Deserialize)]
        struct Tag {
            id: String,
            name: String,
        }
        #[derive(Deserialize)]
        struct Found {
            tags: Vec<Tag>,
        }
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "findTags")]
            find_tags: Found,
        }
        let data: Data = self.query(
            "query($name: String!) { findTags(tag_filter: { name: { value: $name, modifier: EQUALS } }, filter: { per_page: -1 }) { tags { id name } } }",
            json!({ "name": name }),
        )?;
        Ok(data.find_tags.tags.into_iter().find(|t| t.name == name).map(|t| t.id))
    }

    fn create_label(&self, name: &str) -> Result<String> {
        let data: Value = self.query(
            "mutation($input: TagCreateInput!) { tagCreate(input: $input) { id } }",
            json!({ "input": { "name": name } }),
        )?;
        data.pointer("/tagCreate/id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| PipelineError::transient(SERVICE, format!("tagCreate returned no id for '{}'", name)))
    }

    fn find_performers(&self, filter: &PerformerFilter, page: usize, per_page: i64) -> Result<Paged<Performer>> {
        let query = format!(
            "query($filter: FindFilterType, $performer_filter: PerformerFilterType) {{ findPerformers(filter: $filter, performer_filter: $performer_filter) {{ count performers {{ {} }} }} }}",
            PERFORMER_FIELDS
        );
        #[derive(Deserialize)]
        struct Found {
            count: usize,
            performers: Vec<PerformerData>,
        }
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "findPerformers")]
            find_performers: Found,
        }
        let data: Data = self.query(
            &query,
            json!({
                "filter": { "page": page.max(1), "per_page": per_page },
                "performer_filter": performer_filter_json(filter),
            }),
        )?;
        Ok(Paged {
            total: data.find_performers.count,
            items: data.find_performers.performers.into_iter().map(Performer::from).collect(),
        })
    }

    fn find_performer_by_subject(&self, subject: &str) -> Result<Option<Performer>> {
        let query = format!(
            "query($filter: PerformerFilterType) {{ findPerformers(performer_filter: $filter, filter: {{ per_page: -1 }}) {{ performers {{ {} }} }} }}",
            PERFORMER_FIELDS
        );
        let filter = json!({
            "name": { "value": subject, "modifier": "EQUALS" },
            "OR": { "aliases": { "value": subject, "modifier": "INCLUDES" } },
        });
        let data: Value = self.query(&query, json!({ "filter": filter }))?;
        let performers: Vec<PerformerData> = match data.pointer("/findPerformers/performers") {
            Some(list) => serde_json::from_value(list.clone())?,
            None => Vec::new(),
        };
        Ok(performers
            .into_iter()
            .map(Performer::from)
            .find(|p| p.name == subject || p.alias_list.iter().any(|a| a == subject)))
    }

    fn create_performer(&self, performer: &NewPerformer) -> Result<String> {
        let mut input = json!({ "name": performer.name, "alias_list": performer.alias_list });
        if let Some(gender) = performer.gender.as_deref().and_then(gender_enum) {
            input["gender"] = json!(gender);
        }
        if let Some(birthdate) = &performer.birthdate {
            input["birthdate"] = json!(birthdate);
        }
        if let Some(image) = &performer.image {
            input["image"] = json!(image);
        }
        let data: Value = self.query(
            "mutation($input: PerformerCreateInput!) { performerCreate(input: $input) { id } }",
            json!({ "input": input }),
        )?;
        let id = data
            .pointer("/performerCreate/id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| PipelineError::transient(SERVICE, "performerCreate returned no id"))?;
        info!("Created performer {} ({})", id, performer.name);
        Ok(id)
    }

    fn update_performer_aliases(&self, performer_id: &str, aliases: &[String]) -> Result<()> {
        self.update_performer(performer_id, json!({ "alias_list": aliases }))
    }

    fn add_performer_label(&self, performer_id: &str, label_id: &str) -> Result<()> {
        let performer = self.get_performer(performer_id)?;
        if performer.label_ids.iter().any(|l| l == label_id) {
            return Ok(());
        }
        let mut ids = performer.label_ids;
        ids.push(label_id.to_string());
        self.update_performer(performer_id, json!({ "tag_ids": ids }))
    }

    fn get_gallery(&self, gallery_id: &str) -> Result<Gallery> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "findGallery")]
            gallery: Option<Gallery>,
        }
        let data: Data =
            self.query("query($id: ID!) { findGallery(id: $id) { id title image_count } }", json!({ "id": gallery_id }))?;
        data.gallery.ok_or_else(|| PipelineError::NotFound(format!("gallery {}", gallery_id)))
    }

    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let url = if url.starts_with('/') { format!("{}{}", self.connection.base_url(), url) } else { url.to_string() };
        let resp = self.http.get(&url).send()?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PipelineError::transient(SERVICE, format!("download of {} failed: status {}", url, status.as_u16())));
        }
        Ok(resp.bytes()?.to_vec())
    }

    fn trigger_metadata_scan(&self) -> Result<()> {
        let data: Value = self.query("mutation { metadataScan(input: {}) }", json!({}))?;
        let job = scan_job_id(&data);
        info!("Metadata scan queued (job {})", job);
        Ok(())
    }
}

/// Job id from a `metadataScan` response, or "unknown".
fn scan_job_id(data: &Value) -> String {
    match data.get("metadataScan") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_connection_parse() {
        let conn: ServerConnection = serde_json::from_value(json!({
            "Scheme": "http",
            "Host": "0.0.0.0",
            "Port": 9999,
            "SessionCookie": { "Name": "session", "Value": "abc", "Path": "/" },
            "Dir": "/root/.stash"
        }))
        .unwrap();
        assert_eq!(conn.graphql_url(), "http://localhost:9999/graphql");
        assert_eq!(conn.cookie_header().as_deref(), Some("session=abc"));
    }

    #[test]
    fn test_item_filter_json() {
        assert_eq!(item_filter_json(&ItemFilter::all()), json!({}));
        assert_eq!(
            item_filter_json(&ItemFilter::excluding(&["1", "2"])),
            json!({ "tags": { "value": ["1", "2"], "modifier": "EXCLUDES" } })
        );
        assert_eq!(
            item_filter_json(&ItemFilter::including("1").and_excluding("3")),
            json!({ "tags": { "value": ["1"], "modifier": "INCLUDES_ALL", "excludes": ["3"] } })
        );
        assert_eq!(
            item_filter_json(&ItemFilter::in_gallery("9")),
            json!({ "galleries": { "value": ["9"], "modifier": "INCLUDES" } })
        );
    }

    #[test]
    fn test_performer_filter_json() {
        let filter = PerformerFilter { exclude_labels: vec!["5".into()], require_image: true };
        assert_eq!(
            performer_filter_json(&filter),
            json!({ "tags": { "value": ["5"], "modifier": "EXCLUDES" }, "NOT": { "is_missing": "image" } })
        );
    }

    #[test]
    fn test_item_data_conversion() {
        let data: ItemData = serde_json::from_value(json!({
            "id": "4",
            "files": [{ "path": "/media/v.mp4" }],
            "performers": [{ "id": "7" }],
            "tags": [{ "id": "1" }, { "id": "2" }],
            "paths": { "sprite": "http://0.0.0.0:9999/scene/4/sprite", "vtt": "http://0.0.0.0:9999/scene/4/vtt" }
        }))
        .unwrap();
        let item = data.into_item(MediaKind::Scene);
        assert_eq!(item.primary_file().unwrap(), "/media/v.mp4");
        assert_eq!(item.performer_ids, vec!["7"]);
        assert!(item.has_label("2"));
        assert!(item.sprite.vtt.unwrap().ends_with("/vtt"));
    }

    #[test]
    fn test_gender_enum() {
        assert_eq!(gender_enum("male"), Some("MALE"));
        assert_eq!(gender_enum(" Female "), Some("FEMALE"));
        assert_eq!(gender_enum(""), None);
    }

    #[test]
    fn test_scan_job_id() {
        assert_eq!(scan_job_id(&json!({ "metadataScan": "42" })), "42");
        assert_eq!(scan_job_id(&json!({ "metadataScan": 7 })), "7");
        assert_eq!(scan_job_id(&json!({ "metadataScan": null })), "unknown");
        assert_eq!(scan_job_id(&json!({})), "unknown");
    }
}
