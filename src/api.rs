use async_trait::async_trait;
use reqwest::{
    multipart::{Form, Part},
    Client, Response,
};
use serde::{de::DeserializeOwned, Deserialize};
use tracing::{error, info};

use crate::{
    error::ApiError,
    models::{DesignRecord, DesignRequest, FloorPlanRequest, GenerationResult, ImageFile, LayoutRequest, RoomDesignRequest, Style, UploadResult},
};

const UPLOAD_FAILED: &str = "Failed to upload image";
const GENERIC_FAILURE: &str = "Something went wrong";
const DESIGN_FAILED: &str = "Failed to generate design";
const STYLES_FAILED: &str = "Failed to load design styles";
const DESIGNS_FAILED: &str = "Failed to load designs";

/// Calls the workflow controller needs from the generation service.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn upload_image(&self, file: &ImageFile) -> Result<UploadResult, ApiError>;
    async fn list_styles(&self) -> Result<Vec<Style>, ApiError>;
    async fn generate_layout(&self, request: &LayoutRequest) -> Result<GenerationResult, ApiError>;
    async fn generate_room_design(&self, request: &RoomDesignRequest) -> Result<GenerationResult, ApiError>;
    async fn generate_design(&self, request: &FloorPlanRequest) -> Result<GenerationResult, ApiError>;
    async fn list_designs(&self) -> Result<Vec<DesignRecord>, ApiError>;

    async fn generate(&self, request: &DesignRequest) -> Result<GenerationResult, ApiError> {
        match request {
            DesignRequest::Layout(r) => self.generate_layout(r).await,
            DesignRequest::RoomDesign(r) => self.generate_room_design(r).await,
            DesignRequest::FloorPlan(r) => self.generate_design(r).await,
        }
    }
}

pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { client: Client::new(), base_url: base_url.into().trim_end_matches('/').to_string() }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Media paths come back relative to the service root.
    fn resolve_media(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }
}

#[async_trait]
impl Transport for ApiClient {
    async fn upload_image(&self, file: &ImageFile) -> Result<UploadResult, ApiError> {
        info!("📤 Uploading image {} ({} bytes)", file.name, file.bytes.len());
        let form = Form::new().part("image", image_part(file)?);
        let response = self.client.post(self.url("/api/upload-image/")).multipart(form).send().await?;

        #[derive(Deserialize)]
        struct UploadResponse {
            url: Option<String>,
        }
        let body: UploadResponse = read_json(response, UPLOAD_FAILED).await?;
        match body.url.filter(|u| !u.is_empty()) {
            Some(url) => {
                info!("✅ Image stored at {}", url);
                Ok(UploadResult { url })
            }
            None => Err(ApiError::UnexpectedResponse("Failed to get image URL from upload".into())),
        }
    }

    async fn list_styles(&self) -> Result<Vec<Style>, ApiError> {
        let response = self.client.get(self.url("/styles/")).send().await?;
        let styles: Vec<Style> = read_json(response, STYLES_FAILED).await?;
        info!("🎨 Loaded {} design styles", styles.len());
        Ok(styles)
    }

    async fn generate_layout(&self, request: &LayoutRequest) -> Result<GenerationResult, ApiError> {
        info!("🎯 Generating 3D layout for {}", request.image);
        let response = self.client.post(self.url("/api/generate-3d-layout/")).json(request).send().await?;

        #[derive(Deserialize)]
        struct LayoutResponse {
            message: Option<String>,
            image_urls: Option<Vec<String>>,
            images: Option<Vec<String>>,
            image: Option<String>,
        }
        let body: LayoutResponse = read_json(response, GENERIC_FAILURE).await?;
        let images = body.image_urls.or(body.images).or_else(|| body.image.map(|i| vec![i])).unwrap_or_default();
        finish(images, body.message, "Layout generated successfully!")
    }

    async fn generate_room_design(&self, request: &RoomDesignRequest) -> Result<GenerationResult, ApiError> {
        info!("🎯 Generating {} room design ({}) for {}", request.theme, request.room_type, request.image);
        let response = self.client.post(self.url("/api/room-design/")).json(request).send().await?;

        #[derive(Deserialize)]
        struct RoomDesignResponse {
            url: Option<String>,
            message: Option<String>,
        }
        let body: RoomDesignResponse = read_json(response, GENERIC_FAILURE).await?;
        finish(body.url.into_iter().collect(), body.message, "Room design generated successfully!")
    }

    async fn generate_design(&self, request: &FloorPlanRequest) -> Result<GenerationResult, ApiError> {
        info!("🎯 Generating {} design from floor plan {}", request.room_type, request.floor_plan_image.name);
        let mut form = Form::new()
            .part("floor_plan_image", image_part(&request.floor_plan_image)?)
            .text("image", request.image_url.clone())
            .text("room_type", request.room_type.clone())
            .text("area_sqft", request.area_sqft.to_string())
            .text("style", request.style.to_string())
            .text("color_scheme", request.color_scheme.clone())
            .text("budget_level", request.budget_level.clone())
            .text("lighting_preference", request.lighting_preference.clone());
        if let Some(notes) = &request.additional_notes {
            form = form.text("additional_notes", notes.clone());
        }
        let response = self.client.post(self.url("/generate/")).multipart(form).send().await?;

        #[derive(Deserialize)]
        struct DesignResponse {
            generated_image: Option<String>,
        }
        let body: DesignResponse = read_json(response, DESIGN_FAILED).await?;
        let images = body.generated_image.filter(|p| !p.is_empty()).map(|p| self.resolve_media(&p)).into_iter().collect();
        finish(images, None, "Design generated successfully")
    }

    async fn list_designs(&self) -> Result<Vec<DesignRecord>, ApiError> {
        let response = self.client.get(self.url("/designs/")).send().await?;
        let mut designs: Vec<DesignRecord> = read_json(response, DESIGNS_FAILED).await?;
        for design in &mut designs {
            design.generated_image = self.resolve_media(&design.generated_image);
            if let Some(edge_map) = design.edge_map.as_mut() {
                *edge_map = self.resolve_media(edge_map);
            }
            if let Some(plan) = design.floor_plan.as_mut() {
                plan.image = self.resolve_media(&plan.image);
            }
        }
        info!("🗂️ Loaded {} stored designs", designs.len());
        Ok(designs)
    }
}

fn image_part(file: &ImageFile) -> Result<Part, ApiError> {
    Ok(Part::bytes(file.bytes.to_vec()).file_name(file.name.clone()).mime_str(&file.mime)?)
}

/// Turns non-2xx responses into `ApiError::Status`, preferring the server's `error` field.
async fn read_json<T: DeserializeOwned>(response: Response, fallback: &str) -> Result<T, ApiError> {
    let status = response.status();
    let text = response.text().await?;

    if !status.is_success() {
        error!("❌ API error response ({}): {}", status, text);
        let message = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| fallback.to_string());
        return Err(ApiError::Status { status: status.as_u16(), message });
    }

    serde_json::from_str(&text).map_err(|e| {
        error!("❌ Could not parse API response: {}: {}", e, text);
        ApiError::UnexpectedResponse(fallback.to_string())
    })
}

fn finish(images: Vec<String>, message: Option<String>, default_message: &str) -> Result<GenerationResult, ApiError> {
    if images.is_empty() {
        return Err(ApiError::UnexpectedResponse("No generated images in response".into()));
    }
    info!("✅ Generation returned {} image(s)", images.len());
    Ok(GenerationResult {
        message: message.filter(|m| !m.is_empty()).unwrap_or_else(|| default_message.to_string()),
        images,
    })
}

/// Binds an in-process stub of the generation service and returns its base URL.
#[cfg(test)]
pub(crate) async fn serve_stub(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}
