//! Normalize a parser's [`FieldSet`] into the output schema.

use crate::error::HeaderError;
use crate::model::{FieldSet, HeaderData, Length};

fn metres(length: Option<Length>) -> Option<f64> {
    length.map(|l| l.metres()).filter(|m| m.is_finite() && *m > 0.0)
}

/// Build [`HeaderData`] from recovered fields.
///
/// Width, height and format are required and dimensions must be positive.
/// Physical sizes are converted to metres and the sample type gets its
/// canonical name. Everything else stays absent when the parser found nothing.
pub fn assemble(fields: FieldSet) -> Result<HeaderData, HeaderError> {
    let format = fields
        .format
        .ok_or_else(|| HeaderError::invalid_header("format not determined"))?;
    let width = fields
        .width
        .filter(|&w| w > 0)
        .ok_or_else(|| HeaderError::invalid_header(format!("{format} header has no width")))?;
    let height = fields
        .height
        .filter(|&h| h > 0)
        .ok_or_else(|| HeaderError::invalid_header(format!("{format} header has no height")))?;

    Ok(HeaderData {
        format,
        width,
        height,
        depth: fields.depth,
        dtype: fields.sample_type.map(|t| t.canonical_name()),
        single_voxel_physical_size_x: metres(fields.voxel_x),
        single_voxel_physical_size_y: metres(fields.voxel_y),
        single_voxel_physical_size_z: metres(fields.voxel_z),
        directory_count: fields.directory_count,
    })
}
