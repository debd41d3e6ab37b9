// src/llm_extract.rs

use crate::config::ModelSection;
use crate::error::ExtractError;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{info, warn};

/// Nested invoice record as returned by the model, section name -> value.
pub type ExtractionResult = Map<String, Value>;

/// Image extensions the model is fed, lowercase.
pub const SUPPORTED_IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "gif", "bmp", "tiff"];

/// Gemini takes the credential here, so it never lands in a URL.
const API_KEY_HEADER: &str = "x-goog-api-key";

/// Upper bound on `{` positions tried when digging JSON out of prose.
const MAX_JSON_CANDIDATES: usize = 32;

/// Instructs the model to extract a GST invoice into a fixed JSON shape.
const EXTRACTION_PROMPT: &str = r#"Extract all data from this GST invoice and return it in a structured JSON format.

For invoices with multiple items, create an array of items with all their details.

Return the response in this exact JSON structure:
{
  "company_info": {
    "company_name": "string", "company_address": "string", "city": "string",
    "pincode": "string", "gstin": "string", "email": "string", "phone": "string",
    "website_url": "string", "pan_number": "string",
    "state_and_state_code": "string", "contact_person_name": "string"
  },
  "invoice_info": {
    "gst_invoice_number": "string", "invoice_date": "string", "invoice_type": "string",
    "challan_number": "string", "challan_date": "string",
    "purchase_order_number": "string", "purchase_order_date": "string",
    "place_of_supply": "string", "place_of_delivery": "string",
    "reverse_charge_applicable": "string", "e_invoice_irn": "string",
    "e_way_bill_number": "string", "qr_code": "string"
  },
  "billing_info": {
    "billing_company_name": "string", "billing_address": "string",
    "billing_city": "string", "billing_pincode": "string",
    "billing_party_gstin": "string", "email_and_phone_of_buyer": "string"
  },
  "shipping_info": {
    "shipping_company_name": "string", "shipping_address": "string",
    "shipping_city": "string", "shipping_pincode": "string",
    "shipping_party_gstin": "string"
  },
  "items": [
    {
      "description_of_goods": "string", "hsn_code": "string", "quantity": "number",
      "uqc": "string", "weight": "string", "rate": "number", "amount": "number",
      "discount_per_item": "number", "taxable_value": "number", "batch_no": "string",
      "expiry_date": "string", "manufacturing_date": "string"
    }
  ],
  "tax_info": { "cgst": "number", "sgst": "number", "igst": "number", "cess_amount": "number" },
  "totals": { "invoice_amount": "number", "total_invoice": "number" },
  "transport_info": {
    "transporter_details": "string", "vehicle_number": "string",
    "lr_number": "string", "transporter_id": "string"
  },
  "bank_info": { "bank_details": "string" }
}

IMPORTANT INSTRUCTIONS:
1. If any field is not present or not applicable, set it to null
2. For items array, include ALL items found on the invoice with their complete details
3. Make sure all numerical values are properly formatted as numbers, not strings
4. Only extract data that is actually present on the invoice
5. Do not make up or assume any values"#;

/// Anything that can turn a prompt plus an image into text.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        image: &[u8],
        mime_type: &str,
    ) -> Result<String, ExtractError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", skip_deserializing)]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

/// Google Gemini `generateContent` over REST.
pub struct GeminiBackend {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl GeminiBackend {
    pub fn new(section: &ModelSection, api_key: String) -> Result<Self, ExtractError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(section.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: section.base_url.trim_end_matches('/').to_string(),
            model: section.model.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl ModelBackend for GeminiBackend {
    async fn generate(
        &self,
        prompt: &str,
        image: &[u8],
        mime_type: &str,
    ) -> Result<String, ExtractError> {
        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![
                    Part {
                        text: Some(prompt.to_string()),
                        inline_data: None,
                    },
                    Part {
                        text: None,
                        inline_data: Some(InlineData {
                            mime_type: mime_type.to_string(),
                            data: BASE64.encode(image),
                        }),
                    },
                ],
            }],
            generation_config: GenerationConfig { temperature: 0.0 },
        };

        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url,
            urlencoding::encode(&self.model)
        );

        info!(model = %self.model, bytes = image.len(), mime = mime_type, "Sending image to model");
        let response = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractError::Api { status, body });
        }

        let reply: GenerateResponse = response.json().await?;
        let text: String = reply
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(ExtractError::EmptyResponse);
        }
        Ok(text)
    }
}

/// Wraps a model backend with the fixed prompt and reply parsing.
/// Without a backend every extraction fails with `Unavailable`.
#[derive(Clone)]
pub struct ExtractionClient {
    backend: Option<Arc<dyn ModelBackend>>,
}

impl ExtractionClient {
    pub fn new(backend: Option<Arc<dyn ModelBackend>>) -> Self {
        Self { backend }
    }

    /// Build the Gemini-backed client, or an unavailable one when the
    /// credential is missing.
    pub fn from_config(section: &ModelSection) -> Self {
        let Some(api_key) = section.api_key() else {
            warn!(env = %section.api_key_env, "No model API key set, extraction disabled");
            return Self::new(None);
        };
        match GeminiBackend::new(section, api_key) {
            Ok(backend) => {
                info!(model = %section.model, "Extraction client ready");
                Self::new(Some(Arc::new(backend)))
            }
            Err(e) => {
                warn!(error = %e, "Could not build model client, extraction disabled");
                Self::new(None)
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_some()
    }

    /// Read an image from disk and extract invoice fields from it.
    pub async fn extract_from_file(&self, path: &Path) -> Result<ExtractionResult, ExtractError> {
        if self.backend.is_none() {
            return Err(ExtractError::Unavailable);
        }
        let image = tokio::fs::read(path).await?;
        let mime = path
            .extension()
            .and_then(|e| e.to_str())
            .map(mime_for_extension)
            .unwrap_or("image/jpeg");
        self.extract(&image, mime).await
    }

    pub async fn extract(&self, image: &[u8], mime_type: &str) -> Result<ExtractionResult, ExtractError> {
        let backend = self.backend.as_ref().ok_or(ExtractError::Unavailable)?;
        let reply = backend.generate(EXTRACTION_PROMPT, image, mime_type).await?;
        let result = parse_model_reply(&reply)?;
        info!(sections = result.len(), "Extraction parsed");
        Ok(result)
    }
}

pub fn mime_for_extension(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "tiff" | "tif" => "image/tiff",
        _ => "image/jpeg",
    }
}

/// Parse the model's text reply into a record: strict parse first, then
/// recover the first balanced JSON object from surrounding prose. Top-level
/// nulls are dropped.
pub fn parse_model_reply(reply: &str) -> Result<ExtractionResult, ExtractError> {
    let text = strip_fences(reply);

    let value = match serde_json::from_str::<Value>(text) {
        Ok(v) => v,
        Err(_) => {
            let object = find_json_object(text).ok_or(ExtractError::Parse)?;
            Value::Object(object)
        }
    };

    match value {
        Value::Object(map) => Ok(drop_top_level_nulls(map)),
        _ => Err(ExtractError::Parse),
    }
}

fn drop_top_level_nulls(map: ExtractionResult) -> ExtractionResult {
    map.into_iter().filter(|(_, v)| !v.is_null()).collect()
}

static FENCE_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)^\s*```(?:json)?\s*(.*?)\s*```\s*$").ok());

/// Strip markdown code fences if the model added them despite instructions.
fn strip_fences(s: &str) -> &str {
    let Some(re) = FENCE_RE.as_ref() else {
        return s.trim();
    };
    match re.captures(s).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str(),
        None => s.trim(),
    }
}

/// Try each `{` in turn (bounded) and return the first balanced span that
/// parses as a JSON object.
fn find_json_object(s: &str) -> Option<ExtractionResult> {
    let mut from = 0;
    for _ in 0..MAX_JSON_CANDIDATES {
        let start = from + s[from..].find('{')?;
        let end = balanced_end(&s[start..])?;
        if let Ok(Value::Object(map)) = serde_json::from_str(&s[start..start + end]) {
            return Some(map);
        }
        from = start + 1;
    }
    None
}

/// Length of the brace-balanced span at the start of `s` (which begins
/// with `{`), skipping braces inside string literals.
fn balanced_end(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, b) in s.bytes().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}
