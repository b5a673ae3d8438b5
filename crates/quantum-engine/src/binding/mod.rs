//! Spatial symbol binding.
//!
//! A [`BindingTable`] resolves every read of a name to the nearest preceding
//! definition of that name, and keeps those links correct while definitions
//! and reads are added, moved and removed.

mod slot_list;
mod table;

pub use slot_list::{GetterId, SlotPosition, VariableId};
pub use table::{BindingTable, BoundValue, Effects};
