use crate::error::SearchError;
use crate::signing::{self, FormValue, SignedForm};
use crate::types::ImageSource;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
enum Endpoint {
    Query,
    Update,
    Result,
    Object,
}

impl Endpoint {
    fn path(self) -> &'static str {
        match self {
            Endpoint::Query => "query/",
            Endpoint::Update => "update/",
            Endpoint::Result => "result/",
            Endpoint::Object => "object/",
        }
    }
}

/// Optional fields accepted by `submit`.
#[derive(Debug, Default, Clone)]
pub struct QueryOptions {
    pub webhook: Option<String>,
    pub extra: Option<String>,
    pub json: bool,
    pub gps_latitude: Option<f64>,
    pub gps_longitude: Option<f64>,
    pub gps_altitude: Option<f64>,
}

/// Optional fields accepted by `upload_object`.
#[derive(Debug, Default, Clone)]
pub struct UploadOptions {
    pub custom_id: Option<String>,
    pub meta: Option<String>,
    pub collection: Option<String>,
    pub json: bool,
}

/// Outcome of a successful submit: the query id results will be keyed by,
/// plus the raw response body.
#[derive(Debug)]
pub struct Submission {
    pub qid: String,
    pub raw: String,
}

#[derive(Debug, Deserialize)]
struct SubmitEnvelope {
    #[serde(default)]
    data: Option<SubmitData>,
}

#[derive(Debug, Deserialize)]
struct SubmitData {
    #[serde(default)]
    qid: Option<String>,
}

/// Where the poller gets update payloads from. Split out so the poll loop
/// can be driven without a live service.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn poll_updates(&self, device_id: Option<&str>) -> Result<String, SearchError>;
}

/// Signed multipart client for the visual search service.
pub struct RemoteClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: String,
    api_secret: String,
}

impl RemoteClient {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Result<Self, SearchError> {
        let base_url = Url::parse(base_url)?;
        log::debug!("Creating remote search client for {}", base_url);
        // No overall timeout: the update endpoint holds requests open for
        // up to ~90s server-side.
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(RemoteClient {
            http,
            base_url,
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        })
    }

    pub async fn submit(
        &self,
        image: &ImageSource,
        device_id: Option<&str>,
        opts: &QueryOptions,
    ) -> Result<Submission, SearchError> {
        let mut form = SignedForm::new();
        form.insert_text("api_key", self.api_key.clone());
        form.insert_text("time_stamp", signing::timestamp());
        form.insert_file("img", image.clone());
        if let Some(device_id) = device_id {
            form.insert_text("device_id", device_id);
        }
        if opts.json {
            form.insert_text("json", "1");
        }
        if let Some(webhook) = &opts.webhook {
            form.insert_text("webhook", webhook.clone());
        }
        if let Some(extra) = &opts.extra {
            form.insert_text("extra", extra.clone());
        }
        if let Some(lat) = opts.gps_latitude {
            form.insert_text("gps_latitude", lat.to_string());
        }
        if let Some(lon) = opts.gps_longitude {
            form.insert_text("gps_longitude", lon.to_string());
        }
        if let Some(alt) = opts.gps_altitude {
            form.insert_text("gps_altitude", alt.to_string());
        }

        let (signature, raw) = self.post_signed(Endpoint::Query, &form).await?;
        // The service keys results by the submitting request's signature;
        // prefer the id echoed in the body, fall back to the signature.
        let qid = parse_qid(&raw).unwrap_or(signature);
        log::debug!("Submitted remote query {}", qid);
        Ok(Submission { qid, raw })
    }

    pub async fn fetch_result(&self, qid: &str, json: bool) -> Result<String, SearchError> {
        let mut form = SignedForm::new();
        form.insert_text("api_key", self.api_key.clone());
        form.insert_text("time_stamp", signing::timestamp());
        form.insert_text("qid", qid);
        if json {
            form.insert_text("json", "1");
        }
        let (_, raw) = self.post_signed(Endpoint::Result, &form).await?;
        Ok(raw)
    }

    pub async fn upload_object(
        &self,
        images: &[ImageSource],
        name: &str,
        opts: &UploadOptions,
    ) -> Result<String, SearchError> {
        if images.is_empty() {
            return Err(SearchError::Protocol(
                "object upload needs at least one image".into(),
            ));
        }

        let mut form = SignedForm::new();
        form.insert_text("api_key", self.api_key.clone());
        form.insert_text("time_stamp", signing::timestamp());
        form.insert_text("name", name);
        for (i, image) in images.iter().enumerate() {
            form.insert_file(format!("images{}", i + 1), image.clone());
        }
        if let Some(custom_id) = &opts.custom_id {
            form.insert_text("custom_id", custom_id.clone());
        }
        if let Some(meta) = &opts.meta {
            form.insert_text("meta", meta.clone());
        }
        if let Some(collection) = &opts.collection {
            form.insert_text("collection", collection.clone());
        }
        if opts.json {
            form.insert_text("json", "1");
        }

        let (_, raw) = self.post_signed(Endpoint::Object, &form).await?;
        log::info!("Uploaded object '{}' with {} images", name, images.len());
        Ok(raw)
    }

    async fn post_signed(
        &self,
        endpoint: Endpoint,
        form: &SignedForm,
    ) -> Result<(String, String), SearchError> {
        let signature = form.signature(&self.api_secret)?;

        let mut multipart = Form::new();
        for (key, value) in form.fields() {
            match value {
                FormValue::Text(v) => {
                    multipart = multipart.text(key.clone(), v.clone());
                }
                FormValue::File(source) => {
                    multipart = multipart.part(part_name(key), file_part(source).await?);
                }
            }
        }
        // The signature goes out last and was never part of the signed string.
        multipart = multipart.text("api_sig", signature.clone());

        let url = endpoint_url(&self.base_url, endpoint);
        log::debug!("POST {}", url);
        let response = self.http.post(&url).multipart(multipart).send().await?;
        let status = response.status();
        let body = response.text().await?;
        log::trace!("{} responded {} with {} bytes", url, status, body.len());
        Ok((signature, body))
    }
}

#[async_trait]
impl UpdateSource for RemoteClient {
    async fn poll_updates(&self, device_id: Option<&str>) -> Result<String, SearchError> {
        let mut form = SignedForm::new();
        form.insert_text("api_key", self.api_key.clone());
        form.insert_text("time_stamp", signing::timestamp());
        form.insert_text("json", "1");
        if let Some(device_id) = device_id {
            form.insert_text("device_id", device_id);
        }
        let (_, raw) = self.post_signed(Endpoint::Update, &form).await?;
        Ok(raw)
    }
}

fn endpoint_url(base_url: &Url, endpoint: Endpoint) -> String {
    format!(
        "{}/{}",
        base_url.as_str().trim_end_matches('/'),
        endpoint.path()
    )
}

fn part_name(key: &str) -> String {
    // Exemplar files are numbered for signing but all posted as "images".
    if key.starts_with("images") {
        "images".to_string()
    } else {
        key.to_string()
    }
}

async fn file_part(source: &ImageSource) -> Result<Part, SearchError> {
    let file_name = source.file_name();
    let bytes = source.load().await?;
    let mime = mime_guess::from_path(&file_name)
        .first()
        .unwrap_or(mime::APPLICATION_OCTET_STREAM);
    let part = Part::bytes(bytes)
        .file_name(file_name)
        .mime_str(mime.essence_str())?;
    Ok(part)
}

fn parse_qid(raw: &str) -> Option<String> {
    serde_json::from_str::<SubmitEnvelope>(raw)
        .ok()
        .and_then(|envelope| envelope.data)
        .and_then(|data| data.qid)
}
