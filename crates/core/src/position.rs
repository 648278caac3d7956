use crate::error::PositionError;
use crate::models::{BoundingBox, DocumentChunk};
use serde::Serialize;
use std::fmt;

const LOWER_BAND_PERCENT: f64 = 33.0;
const UPPER_BAND_PERCENT: f64 = 67.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerticalBand {
    Top,
    Middle,
    Bottom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HorizontalBand {
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PositionLabel {
    pub vertical: VerticalBand,
    pub horizontal: HorizontalBand,
}

impl fmt::Display for PositionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let vertical = match self.vertical {
            VerticalBand::Top => "top",
            VerticalBand::Middle => "middle",
            VerticalBand::Bottom => "bottom",
        };
        let horizontal = match self.horizontal {
            HorizontalBand::Left => "left",
            HorizontalBand::Center => "center",
            HorizontalBand::Right => "right",
        };
        write!(f, "{vertical}-{horizontal}")
    }
}

/// Where a bbox sits on its page. Derived on read, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PositionDescriptor {
    pub label: PositionLabel,
    /// Center of the bbox as a percentage of page width.
    pub relative_x: f64,
    /// Center of the bbox as a percentage of page height, measured from the bottom.
    pub relative_y: f64,
}

pub fn resolve(
    bbox: &BoundingBox,
    page_width: f64,
    page_height: f64,
) -> Result<PositionDescriptor, PositionError> {
    let usable = |value: f64| value.is_finite() && value > 0.0;
    if !usable(page_width) || !usable(page_height) {
        return Err(PositionError::InvalidPageGeometry {
            width: page_width,
            height: page_height,
        });
    }

    let (center_x, center_y) = bbox.center();
    let relative_x = 100.0 * center_x / page_width;
    let relative_y = 100.0 * center_y / page_height;

    let vertical = if relative_y > UPPER_BAND_PERCENT {
        VerticalBand::Top
    } else if relative_y < LOWER_BAND_PERCENT {
        VerticalBand::Bottom
    } else {
        VerticalBand::Middle
    };

    let horizontal = if relative_x < LOWER_BAND_PERCENT {
        HorizontalBand::Left
    } else if relative_x > UPPER_BAND_PERCENT {
        HorizontalBand::Right
    } else {
        HorizontalBand::Center
    };

    Ok(PositionDescriptor {
        label: PositionLabel {
            vertical,
            horizontal,
        },
        relative_x,
        relative_y,
    })
}

impl DocumentChunk {
    pub fn position(&self) -> Result<PositionDescriptor, PositionError> {
        resolve(&self.bbox, self.page_width, self.page_height)
    }
}
