use std::sync::Arc;

use anyhow::anyhow;
use poem::web::Data;
use poem::{Endpoint, EndpointExt, Route};
use poem_openapi::payload::{Binary, Json};
use poem_openapi::types::multipart::Upload;
use poem_openapi::{ApiResponse, Multipart, Object, OpenApi, OpenApiService, Tags};

use crate::controller::{SwapController, SwapError};

#[derive(Tags)]
enum ApiTags {
    /// Face swap jobs relayed to the inference backend.
    FaceSwap,

    /// Service status.
    Health,
}

#[derive(Object, Debug)]
pub struct FaceSwapRequest {
    /// The image the face is taken from, base64 encoded.
    ///
    /// A `data:<mime>;base64,` prefix is accepted.
    source_image: String,

    /// The image the face is placed onto, base64 encoded.
    target_image: String,
}

#[derive(Object, Debug)]
pub struct FaceSwapResponse {
    success: bool,

    /// The resulting image, base64 encoded.
    result_image: String,

    /// The time spent processing the swap in seconds.
    processing_time: f64,

    message: String,
}

#[derive(Multipart, Debug)]
pub struct FaceSwapFiles {
    /// The image the face is taken from.
    source_image: Upload,

    /// The image the face is placed onto.
    target_image: Upload,
}

#[derive(Object, Debug)]
pub struct ErrorDetail {
    detail: String,
}

#[derive(Object, Debug)]
pub struct HealthStatus {
    /// Either `healthy` or `error`.
    status: String,

    facefusion_url: String,

    message: String,
}

#[derive(ApiResponse)]
#[oai(bad_request_handler = "swap_bad_request")]
pub enum SwapResponse {
    /// The swap succeeded.
    #[oai(status = 200)]
    Ok(Json<FaceSwapResponse>),

    /// The request images could not be decoded.
    #[oai(status = 400)]
    BadRequest(Json<ErrorDetail>),

    /// The backend failed to produce a result.
    #[oai(status = 500)]
    ServerError(Json<ErrorDetail>),
}

#[derive(ApiResponse)]
#[oai(bad_request_handler = "swap_file_bad_request")]
pub enum SwapFileResponse {
    /// The swapped image.
    #[oai(status = 200, content_type = "image/png")]
    Ok(
        Binary<Vec<u8>>,
        #[oai(header = "X-Processing-Time")] String,
        #[oai(header = "Content-Disposition")] String,
    ),

    /// The uploaded images could not be read.
    #[oai(status = 400)]
    BadRequest(Json<ErrorDetail>),

    /// The backend failed to produce a result.
    #[oai(status = 500)]
    ServerError(Json<ErrorDetail>),
}

#[derive(ApiResponse)]
pub enum HealthResponse {
    /// The backend session is established.
    #[oai(status = 200)]
    Healthy(Json<HealthStatus>),

    /// The backend could not be reached at startup.
    #[oai(status = 503)]
    Unavailable(Json<HealthStatus>),
}

fn detail(err: &SwapError) -> Json<ErrorDetail> {
    Json(ErrorDetail {
        detail: err.detail(),
    })
}

fn malformed_request(err: poem::Error) -> Json<ErrorDetail> {
    Json(ErrorDetail {
        detail: format!("Invalid request: {}", err),
    })
}

fn swap_bad_request(err: poem::Error) -> SwapResponse {
    SwapResponse::BadRequest(malformed_request(err))
}

fn swap_file_bad_request(err: poem::Error) -> SwapFileResponse {
    SwapFileResponse::BadRequest(malformed_request(err))
}

impl From<SwapError> for SwapResponse {
    fn from(err: SwapError) -> Self {
        match err {
            SwapError::InvalidInput(_) => Self::BadRequest(detail(&err)),
            _ => Self::ServerError(detail(&err)),
        }
    }
}

impl From<SwapError> for SwapFileResponse {
    fn from(err: SwapError) -> Self {
        match err {
            SwapError::InvalidInput(_) => Self::BadRequest(detail(&err)),
            _ => Self::ServerError(detail(&err)),
        }
    }
}

pub struct FaceSwapApi;

#[OpenApi]
impl FaceSwapApi {
    /// Swap faces between two base64 images
    ///
    /// Takes the face from `source_image` and places it onto `target_image`,
    /// returning the result as a base64 encoded PNG.
    #[oai(path = "/face-swap", method = "post", tag = "ApiTags::FaceSwap")]
    pub async fn face_swap(
        &self,
        controller: Data<&Arc<SwapController>>,
        payload: Json<FaceSwapRequest>,
    ) -> SwapResponse {
        let res = controller
            .swap_base64(&payload.source_image, &payload.target_image)
            .await;

        match res {
            Ok(result) => SwapResponse::Ok(Json(FaceSwapResponse {
                success: true,
                result_image: result.to_base64(),
                processing_time: result.processing_secs(),
                message: "Face swap successful".to_string(),
            })),
            Err(e) => e.into(),
        }
    }

    /// Swap faces between two uploaded files
    ///
    /// Same as `/face-swap` but takes multipart file uploads and responds
    /// with the resulting PNG directly.
    #[oai(path = "/face-swap/files", method = "post", tag = "ApiTags::FaceSwap")]
    pub async fn face_swap_files(
        &self,
        controller: Data<&Arc<SwapController>>,
        files: FaceSwapFiles,
    ) -> SwapFileResponse {
        let source = match files.source_image.into_vec().await {
            Ok(data) => data,
            Err(e) => {
                let err = anyhow!("failed to read source_image: {}", e);
                return SwapError::InvalidInput(err).into();
            },
        };

        let target = match files.target_image.into_vec().await {
            Ok(data) => data,
            Err(e) => {
                let err = anyhow!("failed to read target_image: {}", e);
                return SwapError::InvalidInput(err).into();
            },
        };

        match controller.swap_bytes(source, target).await {
            Ok(result) => {
                let processing_time = result.processing_secs().to_string();
                SwapFileResponse::Ok(
                    Binary(result.data),
                    processing_time,
                    "attachment; filename=\"result.png\"".to_string(),
                )
            },
            Err(e) => e.into(),
        }
    }

    /// Service health
    ///
    /// Reports whether the backend session was established at startup.
    #[oai(path = "/health", method = "get", tag = "ApiTags::Health")]
    pub async fn health(&self, controller: Data<&Arc<SwapController>>) -> HealthResponse {
        let facefusion_url = controller.backend_url().to_string();

        if controller.is_available() {
            HealthResponse::Healthy(Json(HealthStatus {
                status: "healthy".to_string(),
                facefusion_url,
                message: "API is running normally".to_string(),
            }))
        } else {
            HealthResponse::Unavailable(Json(HealthStatus {
                status: "error".to_string(),
                facefusion_url,
                message: "Backend client not initialized".to_string(),
            }))
        }
    }
}

/// Builds the full route tree: the API at the root, its schema at `/spec`
/// and the docs UI at `docs_url`.
pub fn build_app(
    controller: Arc<SwapController>,
    server_url: &str,
    docs_url: &str,
) -> impl Endpoint<Output = poem::Response> {
    let api_service = OpenApiService::new(
        FaceSwapApi,
        "FaceFusion Gateway",
        env!("CARGO_PKG_VERSION"),
    )
    .description(
        "An HTTP gateway relaying face swap jobs to a running FaceFusion web UI.",
    )
    .server(server_url);

    let ui = api_service.redoc();
    let spec = api_service.spec();

    Route::new()
        .at(
            "/spec",
            poem::endpoint::make_sync(move |_| spec.clone()),
        )
        .nest(docs_url, ui)
        .nest("/", api_service)
        .data(controller)
}
