use crate::error::DocumentError;
use crate::position::Size;
use serde::{Deserialize, Serialize};

/// Document-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentOptions {
    /// Spacing of the placement grid. Positions passed through
    /// [`crate::Document::snap_to_grid`] land on its corners.
    pub grid_cell_size: Size,
    /// Hit-test size of a cell until its real size is reported.
    pub default_element_size: Size,
    pub calculation_mode: CalculationMode,
}

impl Default for DocumentOptions {
    fn default() -> Self {
        Self {
            grid_cell_size: Size::new(20.0, 20.0),
            default_element_size: Size::new(20.0, 20.0),
            calculation_mode: CalculationMode::Automatic,
        }
    }
}

impl DocumentOptions {
    /// Parses options; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, DocumentError> {
        Ok(serde_json::from_str(json)?)
    }

    #[must_use]
    pub fn is_manual(&self) -> bool {
        self.calculation_mode == CalculationMode::Manual
    }
}

/// When cells evaluate after their inputs change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CalculationMode {
    /// Re-evaluate as soon as an input changes.
    #[default]
    Automatic,
    /// Only invalidate; evaluation waits for [`crate::Document::recalculate`].
    Manual,
}
