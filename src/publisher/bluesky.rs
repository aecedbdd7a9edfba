use async_trait::async_trait;
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, trace};
use url::Url;

use super::{JobHandle, JobState, PostDraft, Session, SocialPublisher};
use crate::errors::{BotError, Result};

const SERVICE_AUTH_TTL_SECS: i64 = 30 * 60;
const UPLOAD_NAME: &str = "camera.mp4";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Uploads carry the whole video, so they get far longer than other XRPC calls
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionResponse {
    did: String,
    handle: String,
    access_jwt: String,
    did_doc: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ServiceAuthResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    job_id: Option<String>,
    state: Option<String>,
    progress: Option<u64>,
    blob: Option<Value>,
    error: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatusResponse {
    job_status: JobStatus,
}

#[derive(Debug, Deserialize)]
struct CreateRecordResponse {
    uri: String,
}

/// AT Protocol client: session on the account's service, uploads through the
/// video service.
pub struct BlueskyPublisher {
    service: Url,
    video_service: Url,
    client: reqwest::Client,
    upload_timeout: Duration,
}

impl BlueskyPublisher {
    pub fn new(service: &str, video_service: &str) -> Result<Self> {
        Self::with_timeouts(service, video_service, REQUEST_TIMEOUT, UPLOAD_TIMEOUT)
    }

    pub fn with_timeouts(
        service: &str,
        video_service: &str,
        request_timeout: Duration,
        upload_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            service: Url::parse(service)?,
            video_service: Url::parse(video_service)?,
            client,
            upload_timeout,
        })
    }

    async fn service_auth_token(&self, session: &Session) -> Result<String> {
        let host = session
            .pds
            .host_str()
            .ok_or_else(|| BotError::publish(format!("PDS URL has no host: {}", session.pds)))?;
        let mut url = xrpc(&session.pds, "com.atproto.server.getServiceAuth")?;
        url.query_pairs_mut()
            .append_pair("aud", &format!("did:web:{}", host))
            .append_pair("lxm", "com.atproto.repo.uploadBlob")
            .append_pair("exp", &(Utc::now().timestamp() + SERVICE_AUTH_TTL_SECS).to_string());

        let response = self.client.get(url).bearer_auth(&session.access_jwt).send().await?;
        let body: ServiceAuthResponse = parse_response(response, "Service auth").await?;
        Ok(body.token)
    }
}

#[async_trait]
impl SocialPublisher for BlueskyPublisher {
    async fn login(&self, identifier: &str, secret: &str) -> Result<Session> {
        let url = xrpc(&self.service, "com.atproto.server.createSession")?;
        let response = self
            .client
            .post(url)
            .json(&json!({ "identifier": identifier, "password": secret }))
            .send()
            .await?;
        let body: CreateSessionResponse = parse_response(response, "Login").await?;

        if body.did.is_empty() {
            return Err(BotError::publish("Failed to get DID after login"));
        }
        let pds = body
            .did_doc
            .as_ref()
            .and_then(pds_endpoint)
            .unwrap_or_else(|| self.service.clone());
        debug!("Session PDS for {}: {}", body.did, pds);

        Ok(Session {
            did: body.did,
            handle: body.handle,
            access_jwt: body.access_jwt,
            pds,
        })
    }

    async fn upload_video(&self, session: &Session, video: Bytes) -> Result<JobHandle> {
        info!("Uploading video to Bluesky ({:.2} MB)...", video.len() as f64 / (1024.0 * 1024.0));
        let token = self.service_auth_token(session).await?;

        let mut url = xrpc(&self.video_service, "app.bsky.video.uploadVideo")?;
        url.query_pairs_mut()
            .append_pair("did", &session.did)
            .append_pair("name", UPLOAD_NAME);

        let response = self
            .client
            .post(url)
            .timeout(self.upload_timeout)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "video/mp4")
            .body(video)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        trace!(status = %status, body = %text, "Upload response");

        if !status.is_success() {
            if text.contains("already_exists") {
                if let Some(blob) = serde_json::from_str::<Value>(&text).ok().as_ref().and_then(recover_blob) {
                    info!("Video already processed, reusing existing blob");
                    return Ok(JobHandle { job_id: String::new(), blob: Some(blob) });
                }
            }
            return Err(BotError::publish(format!("Video upload failed: {} {}", status, text)));
        }

        let job: JobStatus = serde_json::from_str::<JobStatusResponse>(&text)
            .map(|r| r.job_status)
            .or_else(|_| serde_json::from_str::<JobStatus>(&text))?;
        let job_id = job
            .job_id
            .ok_or_else(|| BotError::publish(format!("Upload response without job id: {}", text)))?;
        info!("Video uploaded, processing...");

        Ok(JobHandle { job_id, blob: job.blob })
    }

    async fn poll_job(&self, _session: &Session, job: &JobHandle) -> Result<JobState> {
        let mut url = xrpc(&self.video_service, "app.bsky.video.getJobStatus")?;
        url.query_pairs_mut().append_pair("jobId", &job.job_id);

        let response = self.client.get(url).send().await?;
        let status = response.status();
        let text = response.text().await?;
        let body: Option<Value> = serde_json::from_str(&text).ok();

        if !status.is_success() {
            if text.contains("already_exists") {
                if let Some(blob) = body.as_ref().and_then(recover_blob) {
                    return Ok(JobState::Done(blob));
                }
            }
            return Err(BotError::publish(format!("Job status request failed: {} {}", status, text)));
        }

        let body = body.ok_or_else(|| BotError::publish(format!("Unreadable job status: {}", text)))?;
        job_state(&body)
    }

    async fn create_post(&self, session: &Session, post: &PostDraft) -> Result<String> {
        let url = xrpc(&session.pds, "com.atproto.repo.createRecord")?;
        let record = post_record(post, &Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        debug!("Creating post record: {}", record);

        let response = self
            .client
            .post(url)
            .bearer_auth(&session.access_jwt)
            .json(&json!({
                "repo": session.did,
                "collection": "app.bsky.feed.post",
                "record": record,
            }))
            .send()
            .await?;
        let body: CreateRecordResponse = parse_response(response, "Post creation").await?;
        Ok(body.uri)
    }
}

fn xrpc(base: &Url, method: &str) -> Result<Url> {
    Ok(base.join(&format!("/xrpc/{}", method))?)
}

async fn parse_response<T: serde::de::DeserializeOwned>(response: reqwest::Response, what: &str) -> Result<T> {
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        return Err(BotError::publish(format!("{} failed: {} {}", what, status, text)));
    }
    Ok(serde_json::from_str(&text)?)
}

/// PDS endpoint advertised in the account's DID document
fn pds_endpoint(did_doc: &Value) -> Option<Url> {
    did_doc
        .get("service")?
        .as_array()?
        .iter()
        .find(|s| s.get("id").and_then(Value::as_str) == Some("#atproto_pds"))?
        .get("serviceEndpoint")?
        .as_str()
        .and_then(|s| Url::parse(s).ok())
}

/// An `already_exists` payload carries the blob of the earlier identical upload
fn recover_blob(body: &Value) -> Option<Value> {
    body.get("blob")
        .or_else(|| body.get("jobStatus").and_then(|s| s.get("blob")))
        .filter(|b| !b.is_null())
        .cloned()
}

fn job_state(body: &Value) -> Result<JobState> {
    let status: JobStatus = serde_json::from_value(body.get("jobStatus").cloned().unwrap_or(Value::Null))?;

    if let Some(blob) = status.blob {
        return Ok(JobState::Done(blob));
    }
    let state = status.state.unwrap_or_default();
    if status.error.as_deref() == Some("already_exists") {
        return recover_blob(body)
            .map(JobState::Done)
            .ok_or_else(|| BotError::publish("Job already exists but no blob was returned"));
    }
    if state == "JOB_STATE_FAILED" {
        let message = status.error.or(status.message).unwrap_or_else(|| "Unknown error".to_string());
        return Ok(JobState::Failed(message));
    }
    Ok(JobState::Pending { state, progress: status.progress })
}

fn post_record(post: &PostDraft, created_at: &str) -> Value {
    let mut record = json!({
        "$type": "app.bsky.feed.post",
        "text": post.text,
        "createdAt": created_at,
        "embed": {
            "$type": "app.bsky.embed.video",
            "video": post.video,
            "aspectRatio": post.aspect_ratio,
        },
    });
    if let Some(ref link) = post.link {
        record["facets"] = json!([{
            "index": { "byteStart": link.byte_start, "byteEnd": link.byte_end },
            "features": [{ "$type": "app.bsky.richtext.facet#link", "uri": link.uri }],
        }]);
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::AspectRatio;
    use crate::publisher::LinkFacet;
    use tokio::net::TcpListener;

    /// Accepts connections and never answers them
    async fn silent_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        format!("http://{}", addr)
    }

    fn session(pds: &str) -> Session {
        Session {
            did: "did:plc:abc".into(),
            handle: "ohio.example".into(),
            access_jwt: "jwt".into(),
            pds: Url::parse(pds).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_stalled_service_times_out() {
        let base = silent_server().await;
        let publisher =
            BlueskyPublisher::with_timeouts(&base, &base, Duration::from_millis(200), Duration::from_millis(400))
                .unwrap();
        let job = JobHandle { job_id: "job-1".into(), blob: None };

        let bounded = tokio::time::timeout(Duration::from_secs(10), async {
            let login = publisher.login("ohio.example", "secret").await;
            let poll = publisher.poll_job(&session(&base), &job).await;
            (login, poll)
        })
        .await
        .expect("publisher calls must not hang");

        assert!(matches!(bounded.0, Err(BotError::Http { .. })));
        assert!(matches!(bounded.1, Err(BotError::Http { .. })));
    }

    #[test]
    fn test_default_timeouts() {
        let publisher = BlueskyPublisher::new("https://bsky.social", "https://video.bsky.app").unwrap();
        assert_eq!(publisher.upload_timeout, UPLOAD_TIMEOUT);
        assert!(UPLOAD_TIMEOUT > REQUEST_TIMEOUT);
    }

    #[test]
    fn test_xrpc_urls() {
        let base = Url::parse("https://bsky.social").unwrap();
        assert_eq!(
            xrpc(&base, "com.atproto.server.createSession").unwrap().as_str(),
            "https://bsky.social/xrpc/com.atproto.server.createSession"
        );
    }

    #[test]
    fn test_pds_endpoint_from_did_doc() {
        let doc = json!({
            "id": "did:plc:abc",
            "service": [
                { "id": "#bsky_fg", "serviceEndpoint": "https://feed.example" },
                { "id": "#atproto_pds", "type": "AtprotoPersonalDataServer", "serviceEndpoint": "https://morel.us-east.host.bsky.network" }
            ]
        });
        assert_eq!(
            pds_endpoint(&doc).unwrap().host_str(),
            Some("morel.us-east.host.bsky.network")
        );
        assert!(pds_endpoint(&json!({})).is_none());
    }

    #[test]
    fn test_job_states() {
        let pending = json!({"jobStatus": {"jobId": "j", "state": "JOB_STATE_ENCODING", "progress": 55}});
        assert_eq!(
            job_state(&pending).unwrap(),
            JobState::Pending { state: "JOB_STATE_ENCODING".into(), progress: Some(55) }
        );

        let done = json!({"jobStatus": {"state": "JOB_STATE_COMPLETED", "blob": {"ref": {"$link": "bafk"}}}});
        assert_eq!(job_state(&done).unwrap(), JobState::Done(json!({"ref": {"$link": "bafk"}})));

        let failed = json!({"jobStatus": {"state": "JOB_STATE_FAILED", "error": "bad video"}});
        assert_eq!(job_state(&failed).unwrap(), JobState::Failed("bad video".into()));

        let failed_silently = json!({"jobStatus": {"state": "JOB_STATE_FAILED"}});
        assert_eq!(job_state(&failed_silently).unwrap(), JobState::Failed("Unknown error".into()));
    }

    #[test]
    fn test_already_exists_recovers_blob() {
        let body = json!({"error": "already_exists", "jobStatus": {"blob": {"ref": "old"}}});
        assert_eq!(recover_blob(&body), Some(json!({"ref": "old"})));

        let bare = json!({"error": "already_exists", "blob": null});
        assert_eq!(recover_blob(&bare), None);
    }

    #[test]
    fn test_post_record_shape() {
        let draft = PostDraft {
            text: "Cam\n🕒 1:00 PM - 1:15 PM ET\n\n📍: 40.1,-82.9".into(),
            link: Some(LinkFacet { byte_start: 34, byte_end: 45, uri: "https://www.google.com/maps?q=40.1,-82.9".into() }),
            video: json!({"$type": "blob", "ref": {"$link": "bafk"}}),
            aspect_ratio: AspectRatio { width: 1280, height: 720 },
        };
        let record = post_record(&draft, "2026-10-16T12:00:00.000Z");

        assert_eq!(record["$type"], "app.bsky.feed.post");
        assert_eq!(record["embed"]["$type"], "app.bsky.embed.video");
        assert_eq!(record["embed"]["aspectRatio"], json!({"width": 1280, "height": 720}));
        assert_eq!(record["facets"][0]["index"]["byteStart"], 34);
        assert_eq!(record["facets"][0]["features"][0]["uri"], "https://www.google.com/maps?q=40.1,-82.9");

        let plain = post_record(&PostDraft { link: None, ..draft }, "2026-10-16T12:00:00.000Z");
        assert!(plain.get("facets").is_none());
    }
}
