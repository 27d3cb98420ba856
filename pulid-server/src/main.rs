use anyhow::{Context, Result};
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use clap::Parser;
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use pulid_core::{
    identity::HttpIdEncoder, load_model, DeviceMap, GenerationParams, GenerationRequest,
    LoadOptions, ModelLike, OffloadPolicy, PipelineError,
};
use serde::{Deserialize, Serialize};
use std::{io::Cursor, path::PathBuf, sync::Arc};
use tokio::{self, net::TcpListener};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "PuLID-FLUX identity-preserving image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Model variant to use
    #[arg(long, default_value = "flux-dev")]
    model: String,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Keep only the model needed by the current stage on the accelerator
    #[arg(long)]
    offload: bool,

    /// Return identity-encoder debug images with each response
    #[arg(long)]
    dev: bool,

    /// Endpoint of the identity encoder service
    #[arg(long)]
    id_encoder_url: Option<String>,

    /// Local PuLID weights instead of downloading them
    #[arg(long)]
    pulid_weights: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Default)]
struct GenerationBody {
    #[serde(flatten)]
    params: GenerationParams,
    /// Base64 PNG or JPEG of the reference face.
    #[serde(default)]
    id_image: Option<String>,
}

impl GenerationBody {
    fn into_request(self) -> Result<GenerationRequest, ApiError> {
        let mut request = GenerationRequest::new(self.params);
        if let Some(encoded) = self.id_image {
            let bytes = BASE64_STANDARD
                .decode(encoded.trim())
                .map_err(|e| ApiError::BadRequest(format!("id_image is not valid base64: {e}")))?;
            let image = image::load_from_memory(&bytes)
                .map_err(|e| ApiError::BadRequest(format!("id_image is not a readable image: {e}")))?;
            request = request.with_id_image(image);
        }
        Ok(request)
    }
}

#[derive(Serialize, Debug)]
struct GenerationResponse {
    image: String,
    /// Stringified so that 64-bit seeds survive JSON number handling.
    seed: String,
    debug_images: Vec<String>,
}

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    Unavailable(String),
    Internal(String),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            e if e.is_invalid_request() => ApiError::BadRequest(e.to_string()),
            e @ PipelineError::ResourceExhausted(_) => ApiError::Unavailable(e.to_string()),
            e => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        if status.is_server_error() {
            error!(%status, %message, "generation failed");
        }
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

fn image_to_base64_png(img: &DynamicImage) -> Result<String, ApiError> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .map_err(|e| ApiError::Internal(format!("failed to encode PNG: {e}")))?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

// Application state containing the preloaded models and server settings.
struct AppState {
    model: Arc<dyn ModelLike>,
    dev: bool,
}

async fn generate_image_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GenerationBody>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let request = body.into_request()?;
    let model = state.model.clone();
    let output = tokio::task::spawn_blocking(move || model.run(request))
        .await
        .map_err(|e| ApiError::Internal(format!("generation task failed: {e}")))??;

    let debug_images = if state.dev {
        output
            .debug_images
            .iter()
            .map(image_to_base64_png)
            .collect::<Result<Vec<_>, _>>()?
    } else {
        Vec::new()
    };
    Ok(Json(GenerationResponse {
        image: image_to_base64_png(&output.image)?,
        seed: output.seed.to_string(),
        debug_images,
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let options = LoadOptions {
        device_map: DeviceMap::new(args.cpu),
        offload: if args.offload {
            OffloadPolicy::Offload
        } else {
            OffloadPolicy::Resident
        },
        id_encoder: args
            .id_encoder_url
            .map(|url| Box::new(HttpIdEncoder::new(url)) as Box<dyn pulid_core::IdEncoder>),
        pulid_weights: args.pulid_weights,
    };
    let model = load_model(&args.model, Api::new()?, options).await?;

    let shared_state = Arc::new(AppState {
        model,
        dev: args.dev,
    });

    // --- Build axum router with shared state ---
    let app = Router::new()
        .route("/v1/images/generations", post(generate_image_handler))
        .with_state(shared_state);

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!(address = %listener.local_addr()?, "started server");
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use pulid_core::Seed;

    #[test]
    fn body_defaults_and_overrides() {
        let body: GenerationBody = serde_json::from_str(
            r#"{"prompt": "portrait, pixar", "num_steps": 4, "seed": -1, "true_cfg": 3}"#,
        )
        .unwrap();
        assert_eq!(body.params.prompt, "portrait, pixar");
        assert_eq!(body.params.num_steps, 4);
        assert_eq!(body.params.seed, Seed::Random);
        assert_eq!(body.params.true_cfg, 3.0);
        assert_eq!(body.params.width, GenerationParams::default().width);
        assert!(body.id_image.is_none());
    }

    #[test]
    fn string_seed_is_accepted() {
        let body: GenerationBody =
            serde_json::from_str(r#"{"seed": "2680261499100305976"}"#).unwrap();
        assert_eq!(body.params.seed, Seed::Fixed(2680261499100305976));
    }

    #[test]
    fn id_image_is_decoded() {
        let face = DynamicImage::ImageRgb8(RgbImage::new(4, 3));
        let encoded = image_to_base64_png(&face).unwrap();
        let body = GenerationBody {
            id_image: Some(encoded),
            ..Default::default()
        };
        let request = body.into_request().unwrap();
        let id = request.id_image.unwrap();
        assert_eq!((id.width(), id.height()), (4, 3));
    }

    #[test]
    fn bad_id_image_is_a_client_error() {
        let body = GenerationBody {
            id_image: Some("not base64!".to_string()),
            ..Default::default()
        };
        assert!(matches!(body.into_request(), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn error_status_mapping() {
        let status = |e: PipelineError| ApiError::from(e).into_response().status();
        assert_eq!(
            status(PipelineError::InvalidDimension {
                width: 17,
                height: 16
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(PipelineError::ResourceExhausted("cuda".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status(PipelineError::IdEncoder("down".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
