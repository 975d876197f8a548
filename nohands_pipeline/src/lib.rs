//! Dagger image build pipeline for NoHands builds.
//!
//! Loads a checked-out commit from the host, builds it with its Dockerfile,
//! then either publishes the image to a registry or exports it as a tarball
//! next to the sources. Failures never escape as errors: they are folded into
//! a [`BuildOutcome`] so the caller can persist them on the build record.

pub mod containers;

use std::path::PathBuf;
use std::time::Instant;

use dagger_sdk::Query;
use serde::Serialize;

/// Terminal state of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::Failed => "failed",
        }
    }
}

/// Registry credentials used when a build asks to push its image.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    pub url: String,
    pub username: String,
    pub password: String,
}

impl RegistryAuth {
    /// Credentials are only usable when every part is present and non-empty.
    pub fn from_parts(
        url: Option<&str>,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Option<Self> {
        match (url, username, password) {
            (Some(url), Some(username), Some(password))
                if !url.is_empty() && !username.is_empty() && !password.is_empty() =>
            {
                Some(Self {
                    url: url.to_string(),
                    username: username.to_string(),
                    password: password.to_string(),
                })
            }
            _ => None,
        }
    }

    /// Registry address for authentication, with an `https://` scheme when none is given.
    pub fn address(&self) -> String {
        if self.url.starts_with("http://") || self.url.starts_with("https://") {
            self.url.clone()
        } else {
            format!("https://{}", self.url)
        }
    }
}

/// Everything the pipeline needs to build one image.
#[derive(Debug, Clone)]
pub struct ImageBuildRequest {
    /// Checked-out sources on the host.
    pub source_dir: PathBuf,
    /// Dockerfile location relative to `source_dir`.
    pub dockerfile_path: String,
    /// Inline Dockerfile written at `dockerfile_path` before building.
    pub dockerfile_content: Option<String>,
    pub image_name: String,
    pub image_tag: String,
    /// Push target; `None` exports a tarball instead.
    pub registry: Option<RegistryAuth>,
}

impl ImageBuildRequest {
    pub fn local_reference(&self) -> String {
        format!("{}:{}", self.image_name, self.image_tag)
    }

    pub fn registry_reference(&self, registry: &RegistryAuth) -> String {
        format!(
            "{}/{}:{}",
            registry.url.trim_end_matches('/'),
            self.image_name,
            self.image_tag
        )
    }

    /// Where an unpushed image is exported.
    pub fn export_path(&self) -> PathBuf {
        export_path(&self.source_dir, &self.image_name, &self.image_tag)
    }
}

/// Tarball location for an image built without a registry push.
pub fn export_path(source_dir: &std::path::Path, image_name: &str, image_tag: &str) -> PathBuf {
    source_dir.join(format!("{image_name}_{image_tag}.tar"))
}

/// Structured result of a pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct BuildOutcome {
    pub status: OutcomeStatus,
    pub image_tag: String,
    pub logs: String,
    pub error_message: String,
    /// Wall-clock seconds.
    pub duration: f64,
}

impl BuildOutcome {
    pub fn success(image_tag: String, logs: Vec<String>, duration: f64) -> Self {
        Self {
            status: OutcomeStatus::Success,
            image_tag,
            logs: logs.join("\n"),
            error_message: String::new(),
            duration,
        }
    }

    pub fn failed(error_message: String, mut logs: Vec<String>, duration: f64) -> Self {
        logs.push(error_message.clone());
        Self {
            status: OutcomeStatus::Failed,
            image_tag: String::new(),
            logs: logs.join("\n"),
            error_message,
            duration,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

/// Build (and optionally push) an image through the Dagger engine.
pub async fn build_image(request: ImageBuildRequest) -> BuildOutcome {
    let start = Instant::now();
    let (tx, rx) = tokio::sync::oneshot::channel();

    let connected = dagger_sdk::connect(move |client| async move {
        let mut logs = Vec::new();
        let result = run(&client, &request, &mut logs).await;
        let _ = tx.send((logs, result));
        Ok(())
    })
    .await;

    let duration = start.elapsed().as_secs_f64();

    match (connected, rx.await) {
        (Ok(()), Ok((mut logs, Ok(image_tag)))) => {
            logs.push(format!(
                "Build completed successfully in {duration:.2} seconds"
            ));
            BuildOutcome::success(image_tag, logs, duration)
        }
        (Ok(()), Ok((logs, Err(e)))) => {
            let msg = format!("Dagger build failed: {e}");
            tracing::error!("{msg}");
            BuildOutcome::failed(msg, logs, duration)
        }
        (Ok(()), Err(_)) => BuildOutcome::failed(
            "Failed to run build: pipeline finished without a result".to_string(),
            Vec::new(),
            duration,
        ),
        (Err(e), received) => {
            let logs = received.map(|(logs, _)| logs).unwrap_or_default();
            let msg = format!("Failed to run build: {e}");
            tracing::error!("{msg}");
            BuildOutcome::failed(msg, logs, duration)
        }
    }
}

/// Run [`build_image`] to completion on a dedicated current-thread runtime.
///
/// Meant to be called from a blocking thread; one thread per build.
pub fn build_image_blocking(request: ImageBuildRequest) -> BuildOutcome {
    match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime.block_on(build_image(request)),
        Err(e) => BuildOutcome::failed(format!("Failed to run build: {e}"), Vec::new(), 0.0),
    }
}

async fn run(
    client: &Query,
    request: &ImageBuildRequest,
    logs: &mut Vec<String>,
) -> eyre::Result<String> {
    logs.push(format!("Starting build for {}", request.local_reference()));

    let source = containers::source_directory(client, request);

    logs.push(format!("Building image from {}", request.dockerfile_path));
    let container = containers::docker_build(source, &request.dockerfile_path)?;

    match &request.registry {
        Some(registry) => {
            logs.push(format!("Logging in to registry {}", registry.url));
            let container = containers::with_registry_auth(client, container, registry);

            let reference = request.registry_reference(registry);
            logs.push(format!("Pushing image to {reference}"));
            let published = container.publish(reference.clone()).await?;
            logs.push(format!("Successfully pushed image: {published}"));
            Ok(reference)
        }
        None => {
            logs.push("Building image without pushing to registry".to_string());
            let path = request.export_path();
            let exported = container
                .export(path.to_string_lossy().to_string())
                .await?;
            logs.push(format!("Image built and exported to: {exported}"));
            Ok(request.local_reference())
        }
    }
}
