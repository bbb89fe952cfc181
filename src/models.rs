use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, skip_serializing_none, DisplayFromStr, PickFirst};
use std::collections::BTreeMap;

use crate::error::ValidationError;

/// Design preset offered by the generation service.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Style {
    // Integer on the wire; numeric strings are accepted too.
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub message: String,
    pub images: Vec<String>,
}

/// One stored floor plan design, as listed by the design history endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignRecord {
    pub id: u64,
    #[serde(default)]
    pub floor_plan: Option<FloorPlanRecord>,
    #[serde(default)]
    pub preferences: Option<PreferenceRecord>,
    pub generated_image: String,
    #[serde(default)]
    pub edge_map: Option<String>,
    #[serde(default)]
    pub prompt_used: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub processing_time: Option<f64>,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloorPlanRecord {
    pub id: u64,
    pub image: String,
    #[serde(default)]
    pub uploaded_at: Option<String>,
    pub room_type: String,
    pub area_sqft: u32,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferenceRecord {
    pub id: u64,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub style: u64,
    #[serde(default)]
    pub style_name: String,
    pub color_scheme: String,
    pub budget_level: String,
    pub lighting_preference: String,
    #[serde(default)]
    pub additional_notes: String,
}

/// An image picked by the user. Cloning is cheap, the bytes are shared.
#[derive(Debug, Clone)]
pub struct ImageFile {
    pub name: String,
    pub bytes: Bytes,
    pub mime: String,
}

impl ImageFile {
    /// Sniffs the format from the magic bytes; anything `image` can't recognise is rejected.
    pub fn sniff(name: impl Into<String>, bytes: impl Into<Bytes>) -> Result<Self, ValidationError> {
        let name = name.into();
        let bytes = bytes.into();
        let format = image::guess_format(&bytes).map_err(|_| ValidationError::UnsupportedImage(name.clone()))?;
        Ok(Self { name, bytes, mime: format.to_mime_type().to_string() })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    /// 3D layout from an image and a free-text prompt.
    Layout,
    /// Themed room render from option cards.
    RoomDesign,
    /// Interior design from a floor plan and budget/lighting preferences.
    FloorPlan,
}

impl WorkflowKind {
    pub const ALL: [WorkflowKind; 3] = [WorkflowKind::Layout, WorkflowKind::RoomDesign, WorkflowKind::FloorPlan];

    pub fn fields(self) -> &'static [FieldSpec] {
        match self {
            WorkflowKind::Layout => LAYOUT_FIELDS,
            WorkflowKind::RoomDesign => ROOM_DESIGN_FIELDS,
            WorkflowKind::FloorPlan => FLOOR_PLAN_FIELDS,
        }
    }

    pub fn field(self, name: &str) -> Option<&'static FieldSpec> {
        self.fields().iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldSpec {
    pub name: &'static str,
    pub required: bool,
    pub default: &'static str,
    pub choices: &'static [&'static str],
    /// When set, values outside `choices` are rejected at submit time.
    pub strict: bool,
}

const fn free(name: &'static str, required: bool, default: &'static str) -> FieldSpec {
    FieldSpec { name, required, default, choices: &[], strict: false }
}

const fn cards(name: &'static str, choices: &'static [&'static str]) -> FieldSpec {
    FieldSpec { name, required: true, default: "", choices, strict: false }
}

const fn pick(name: &'static str, default: &'static str, choices: &'static [&'static str]) -> FieldSpec {
    FieldSpec { name, required: true, default, choices, strict: true }
}

const LAYOUT_FIELDS: &[FieldSpec] = &[free("prompt", true, "")];

const ROOM_DESIGN_FIELDS: &[FieldSpec] = &[
    cards("theme", &["modern", "marvel", "disney", "minimalist", "vintage", "industrial", "bohemian", "contemporary"]),
    cards("room_type", &["bedroom", "living room", "kitchen", "bathroom", "office", "playroom", "study room", "gaming room"]),
    cards("color", &["blue", "red", "green", "yellow", "purple", "pink", "white", "black", "gold", "silver"]),
    cards("accessories", &["stars", "plants", "art pieces", "mirrors", "cushions", "rugs", "wall art", "decorative items"]),
    free("furniture", true, ""),
    cards("walls", &["pastel", "bold", "neutral", "textured", "wallpapered", "painted", "wood paneled", "brick"]),
    cards("lights", &["fairy", "chandelier", "led strips", "pendant", "spotlights", "floor lamps", "wall sconces", "natural"]),
    cards("realistic", &["magical", "realistic", "dreamy", "artistic", "futuristic", "cozy", "elegant", "playful"]),
    free("additional_notes", false, ""),
];

const FLOOR_PLAN_FIELDS: &[FieldSpec] = &[
    pick("room_type", "living_room", &["living_room", "bedroom", "kitchen", "bathroom", "dining_room", "office"]),
    free("area_sqft", true, "250"),
    free("style", true, "1"),
    free("color_scheme", true, "Modern Minimalist"),
    pick("budget_level", "luxury", &["budget", "mid_range", "luxury"]),
    pick("lighting_preference", "bright", &["bright", "moderate", "dim"]),
    free("additional_notes", false, ""),
];

/// Current form input, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FormValues(BTreeMap<String, String>);

impl FormValues {
    pub fn defaults(kind: WorkflowKind) -> Self {
        Self(kind.fields().iter().map(|f| (f.name.to_string(), f.default.to_string())).collect())
    }

    pub fn get(&self, name: &str) -> &str {
        self.0.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    fn optional(&self, name: &str) -> Option<String> {
        let v = self.get(name).trim();
        (!v.is_empty()).then(|| v.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayoutRequest {
    pub image: String,
    pub prompt: String,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomDesignRequest {
    pub image: String,
    pub theme: String,
    pub room_type: String,
    pub color: String,
    pub accessories: String,
    pub furniture: String,
    pub walls: String,
    pub lights: String,
    pub realistic: String,
    pub additional_notes: Option<String>,
}

/// Sent as multipart, so it carries the file itself alongside the uploaded URL.
#[derive(Debug, Clone)]
pub struct FloorPlanRequest {
    pub floor_plan_image: ImageFile,
    pub image_url: String,
    pub room_type: String,
    pub area_sqft: u32,
    pub style: u64,
    pub color_scheme: String,
    pub budget_level: String,
    pub lighting_preference: String,
    pub additional_notes: Option<String>,
}

/// A fully validated generation call, ready to be sent.
#[derive(Debug, Clone)]
pub enum DesignRequest {
    Layout(LayoutRequest),
    RoomDesign(RoomDesignRequest),
    FloorPlan(FloorPlanRequest),
}

/// Form values frozen at submit time; only the uploaded image URL is still missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DesignDraft {
    Layout { prompt: String },
    RoomDesign(Box<RoomDesignRequest>),
    FloorPlan { fields: FormValues, area_sqft: u32, style: u64 },
}

impl DesignDraft {
    /// Checks the form against the field catalogue. A floor plan `style` must be the
    /// id of one of `styles` once any are loaded.
    pub fn from_form(kind: WorkflowKind, form: &FormValues, styles: &[Style]) -> Result<Self, ValidationError> {
        for spec in kind.fields() {
            let value = form.get(spec.name).trim();
            if spec.required && value.is_empty() {
                return Err(ValidationError::MissingField(spec.name.to_string()));
            }
            if spec.strict && !value.is_empty() && !spec.choices.contains(&value) {
                return Err(ValidationError::InvalidValue {
                    field: spec.name.to_string(),
                    reason: format!("expected one of {}", spec.choices.join(", ")),
                });
            }
        }

        let text = |name: &str| form.get(name).trim().to_string();
        Ok(match kind {
            WorkflowKind::Layout => DesignDraft::Layout { prompt: text("prompt") },
            WorkflowKind::RoomDesign => DesignDraft::RoomDesign(Box::new(RoomDesignRequest {
                image: String::new(),
                theme: text("theme"),
                room_type: text("room_type"),
                color: text("color"),
                accessories: text("accessories"),
                furniture: text("furniture"),
                walls: text("walls"),
                lights: text("lights"),
                realistic: text("realistic"),
                additional_notes: form.optional("additional_notes"),
            })),
            WorkflowKind::FloorPlan => {
                let area_sqft = match text("area_sqft").parse::<u32>() {
                    Ok(n) if n > 0 => n,
                    _ => {
                        return Err(ValidationError::InvalidValue {
                            field: "area_sqft".into(),
                            reason: "expected a positive whole number".into(),
                        })
                    }
                };
                let style = match text("style").parse::<u64>() {
                    Ok(id) if styles.is_empty() || styles.iter().any(|s| s.id == id) => id,
                    Ok(_) => {
                        return Err(ValidationError::InvalidValue {
                            field: "style".into(),
                            reason: "not one of the available design styles".into(),
                        })
                    }
                    Err(_) => {
                        return Err(ValidationError::InvalidValue {
                            field: "style".into(),
                            reason: "expected a style id".into(),
                        })
                    }
                };
                DesignDraft::FloorPlan { fields: form.clone(), area_sqft, style }
            }
        })
    }

    pub fn into_request(self, image_url: String, file: ImageFile) -> DesignRequest {
        match self {
            DesignDraft::Layout { prompt } => DesignRequest::Layout(LayoutRequest { image: image_url, prompt }),
            DesignDraft::RoomDesign(mut req) => {
                req.image = image_url;
                DesignRequest::RoomDesign(*req)
            }
            DesignDraft::FloorPlan { fields, area_sqft, style } => {
                let text = |name: &str| fields.get(name).trim().to_string();
                DesignRequest::FloorPlan(FloorPlanRequest {
                    floor_plan_image: file,
                    image_url,
                    room_type: text("room_type"),
                    area_sqft,
                    style,
                    color_scheme: text("color_scheme"),
                    budget_level: text("budget_level"),
                    lighting_preference: text("lighting_preference"),
                    additional_notes: fields.optional("additional_notes"),
                })
            }
        }
    }
}

/// Smallest byte string `image::guess_format` recognises as PNG.
#[cfg(test)]
pub(crate) const TEST_PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01";
