//! Anti-spoof model identifiers.
//!
//! Each ensemble member's input geometry is encoded in its file name, e.g.
//! `2.7_80x80_MiniFASNetV2.onnx` (scale 2.7, 80×80 input) or
//! `org_1_80x80_MiniFASNetV1SE.onnx` (no scale: the raw box is used).

use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Scale-slot token meaning "use the detected box as-is".
const UNSCALED_TOKEN: &str = "org";

#[derive(Error, Debug)]
pub enum ModelSpecError {
    #[error("model identifier {0:?} has no HxW input size token")]
    MissingInputSize(String),
    #[error("model identifier {0:?} has no model kind after the input size")]
    MissingKind(String),
    #[error("model identifier {identifier:?}: invalid input size {token:?}")]
    InvalidInputSize { identifier: String, token: String },
    #[error("model identifier {identifier:?}: invalid scale {token:?}")]
    InvalidScale { identifier: String, token: String },
    #[error("failed to list model directory {path}: {source}")]
    ListDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Input geometry and crop policy of one anti-spoof model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSpec {
    /// File name this was parsed from; also the model cache key.
    pub identifier: String,
    pub height_input: u32,
    pub width_input: u32,
    pub model_kind: String,
    /// Box expansion factor; `None` feeds the unexpanded box.
    pub scale: Option<f32>,
}

impl ModelSpec {
    /// Parse a model identifier (a file name, optionally with directories).
    ///
    /// Pure function: the model file is never opened.
    pub fn parse(identifier: &str) -> Result<Self, ModelSpecError> {
        let file_name = Path::new(identifier)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(identifier);
        let stem = strip_extension(file_name);
        let tokens: Vec<&str> = stem.split('_').collect();

        let dims_pos = tokens
            .iter()
            .position(|t| is_dims_token(t))
            .ok_or_else(|| ModelSpecError::MissingInputSize(file_name.to_string()))?;
        let (height_input, width_input) = parse_dims(file_name, tokens[dims_pos])?;

        let model_kind = tokens
            .get(dims_pos + 1)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ModelSpecError::MissingKind(file_name.to_string()))?
            .to_string();

        let scale_token = match tokens.get(dims_pos + 2) {
            Some(suffix) => Some(*suffix),
            None if dims_pos > 0 => Some(tokens[0]),
            None => None,
        };
        let scale = match scale_token {
            None => None,
            Some(t) if t == UNSCALED_TOKEN => None,
            Some(t) => Some(parse_scale(file_name, t)?),
        };

        Ok(Self {
            identifier: file_name.to_string(),
            height_input,
            width_input,
            model_kind,
            scale,
        })
    }

    /// Whether the box is expanded by `scale` before cropping.
    pub fn crops(&self) -> bool {
        self.scale.is_some()
    }
}

/// Parse every model file in `dir`, sorted by file name.
///
/// Called once at startup; the resulting list is the frozen ensemble.
pub fn discover(dir: &Path) -> Result<Vec<ModelSpec>, ModelSpecError> {
    let entries = std::fs::read_dir(dir).map_err(|source| ModelSpecError::ListDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|n| !n.starts_with('.'))
        .collect();
    names.sort();

    names.iter().map(|n| ModelSpec::parse(n)).collect()
}

fn strip_extension(file_name: &str) -> &str {
    match file_name.rsplit_once('.') {
        Some((stem, ext))
            if !ext.contains('_') && ext.bytes().any(|b| b.is_ascii_alphabetic()) =>
        {
            stem
        }
        _ => file_name,
    }
}

fn is_dims_token(token: &str) -> bool {
    token
        .split_once('x')
        .map(|(h, w)| {
            !h.is_empty()
                && !w.is_empty()
                && h.bytes().all(|b| b.is_ascii_digit())
                && w.bytes().all(|b| b.is_ascii_digit())
        })
        .unwrap_or(false)
}

fn parse_dims(identifier: &str, token: &str) -> Result<(u32, u32), ModelSpecError> {
    let invalid = || ModelSpecError::InvalidInputSize {
        identifier: identifier.to_string(),
        token: token.to_string(),
    };
    let (h, w) = token.split_once('x').ok_or_else(invalid)?;
    let h: u32 = h.parse().map_err(|_| invalid())?;
    let w: u32 = w.parse().map_err(|_| invalid())?;
    if h == 0 || w == 0 {
        return Err(invalid());
    }
    Ok((h, w))
}

fn parse_scale(identifier: &str, token: &str) -> Result<f32, ModelSpecError> {
    match token.parse::<f32>() {
        Ok(s) if s.is_finite() && s > 0.0 => Ok(s),
        _ => Err(ModelSpecError::InvalidScale {
            identifier: identifier.to_string(),
            token: token.to_string(),
        }),
    }
}
