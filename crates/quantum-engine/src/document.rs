//! A free-form document: cells at arbitrary positions, grouped into scope regions.

use crate::cas::CasBackend;
use crate::cell::{CellStatus, ExpressionCell};
use crate::error::DocumentError;
use crate::options::{CalculationMode, DocumentOptions};
use crate::position::{Position, Size, Span};
use crate::scope::Scope;
use quantum_expr::Expr;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeId(Uuid);

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct CellEntry {
    id: CellId,
    cell: ExpressionCell,
    size: Option<Size>,
}

struct ScopeRegion {
    id: ScopeId,
    name: String,
    span: Span,
    closed: bool,
    parent: Option<ScopeId>,
    scope: Scope,
}

/// Owns the cells of one document and keeps each one in the right scope.
///
/// Cells are kept in document order. A cell belongs to the innermost scope
/// region containing its position, or to the root scope.
pub struct Document {
    options: DocumentOptions,
    backend: Rc<dyn CasBackend>,
    root: Scope,
    regions: Vec<ScopeRegion>,
    cells: Vec<CellEntry>,
}

impl Document {
    pub fn new(options: DocumentOptions, backend: Rc<dyn CasBackend>) -> Self {
        Self {
            options,
            backend,
            root: Scope::root(),
            regions: Vec::new(),
            cells: Vec::new(),
        }
    }

    pub fn options(&self) -> &DocumentOptions {
        &self.options
    }

    pub fn root_scope(&self) -> &Scope {
        &self.root
    }

    /// Rounds `position` to the nearest grid corner.
    pub fn snap_to_grid(&self, position: Position) -> Position {
        let grid = self.options.grid_cell_size;
        let snap = |value: f64, step: f64| {
            if step > 0.0 {
                (value / step).round() * step
            } else {
                value
            }
        };
        Position::new(snap(position.x.0, grid.width.0), snap(position.y.0, grid.height.0))
    }

    pub fn create_cell(&mut self, position: Position, expression: Expr) -> CellId {
        let id = CellId(Uuid::new_v4());
        let cell = ExpressionCell::new(expression, position, Rc::clone(&self.backend));
        cell.set_automatic(!self.options.is_manual());
        let index = self.insert_index(position);
        self.cells.insert(
            index,
            CellEntry {
                id,
                cell: cell.clone(),
                size: None,
            },
        );
        log::debug!("created cell {id} at {position}");
        cell.set_scope(Some(self.scope_at(position)));
        id
    }

    pub fn cell(&self, id: CellId) -> Option<&ExpressionCell> {
        self.cells.iter().find(|entry| entry.id == id).map(|entry| &entry.cell)
    }

    /// Cells in document order.
    pub fn cells(&self) -> impl Iterator<Item = (CellId, &ExpressionCell)> + '_ {
        self.cells.iter().map(|entry| (entry.id, &entry.cell))
    }

    pub fn set_expression(&mut self, id: CellId, expression: Expr) -> Result<(), DocumentError> {
        let cell = self.cell(id).ok_or(DocumentError::UnknownCell(id))?.clone();
        cell.set_expression(expression);
        Ok(())
    }

    pub fn move_cell(&mut self, id: CellId, position: Position) -> Result<(), DocumentError> {
        let index = self.index_of(id)?;
        let entry = self.cells.remove(index);
        let cell = entry.cell.clone();
        let index = self.insert_index(position);
        self.cells.insert(index, entry);

        cell.set_position(position);
        cell.set_scope(Some(self.scope_at(position)));
        Ok(())
    }

    pub fn delete_cell(&mut self, id: CellId) -> Result<(), DocumentError> {
        let index = self.index_of(id)?;
        let entry = self.cells.remove(index);
        entry.cell.remove();
        log::debug!("deleted cell {id}");
        Ok(())
    }

    pub fn set_cell_size(&mut self, id: CellId, size: Size) -> Result<(), DocumentError> {
        let index = self.index_of(id)?;
        self.cells[index].size = Some(size);
        Ok(())
    }

    /// The topmost cell whose bounds contain `point`.
    pub fn element_at(&self, point: Position) -> Option<CellId> {
        self.cells.iter().rev().find_map(|entry| {
            let origin = entry.cell.position();
            let size = entry.size.unwrap_or(self.options.default_element_size);
            let corner = origin.offset(size);
            let inside = origin.x <= point.x
                && point.x <= corner.x
                && origin.y <= point.y
                && point.y <= corner.y;
            inside.then_some(entry.id)
        })
    }

    /// Adds a scope region covering `[start, end)` in reading order.
    pub fn create_scope(
        &mut self,
        name: impl Into<String>,
        start: Position,
        end: Position,
        closed: bool,
    ) -> Result<ScopeId, DocumentError> {
        if end <= start {
            return Err(DocumentError::InvalidRegion { start, end });
        }
        let id = ScopeId(Uuid::new_v4());
        let name = name.into();
        log::debug!("created scope {name} ({id}) over [{start}, {end})");
        self.regions.push(ScopeRegion {
            id,
            name,
            span: Span {
                start: Some(start),
                end: Some(end),
            },
            closed,
            parent: None,
            // Replaced by `rebuild_scopes`.
            scope: self.root.clone(),
        });
        self.rebuild_scopes(Some(id));
        Ok(id)
    }

    /// Removes a region. Its cells move to the enclosing scope.
    pub fn delete_scope(&mut self, id: ScopeId) -> Result<(), DocumentError> {
        let index = self
            .regions
            .iter()
            .position(|region| region.id == id)
            .ok_or(DocumentError::UnknownScope(id))?;
        let region = self.regions.remove(index);
        log::debug!("deleted scope {} ({id})", region.name);
        self.rebuild_scopes(None);
        Ok(())
    }

    pub fn scope(&self, id: ScopeId) -> Option<&Scope> {
        self.regions
            .iter()
            .find(|region| region.id == id)
            .map(|region| &region.scope)
    }

    /// The scope a cell at `position` belongs to.
    pub fn scope_at(&self, position: Position) -> Scope {
        self.innermost_region(position, None)
            .map(|index| self.regions[index].scope.clone())
            .unwrap_or_else(|| self.root.clone())
    }

    pub fn calculation_mode(&self) -> CalculationMode {
        self.options.calculation_mode
    }

    /// Switching back to automatic evaluates every stale cell.
    pub fn set_calculation_mode(&mut self, mode: CalculationMode) {
        self.options.calculation_mode = mode;
        let automatic = mode == CalculationMode::Automatic;
        for cell in self.cell_handles() {
            cell.set_automatic(automatic);
        }
    }

    /// Evaluates every stale cell, in document order.
    ///
    /// In manual mode, answers that arrive after this returns still leave
    /// their dependents stale until the next recalculation.
    pub fn recalculate(&mut self) {
        for cell in self.cell_handles() {
            if cell.status() == CellStatus::Stale {
                cell.recalculate();
            }
        }
    }

    fn cell_handles(&self) -> Vec<ExpressionCell> {
        self.cells.iter().map(|entry| entry.cell.clone()).collect()
    }

    fn index_of(&self, id: CellId) -> Result<usize, DocumentError> {
        self.cells
            .iter()
            .position(|entry| entry.id == id)
            .ok_or(DocumentError::UnknownCell(id))
    }

    /// Equal positions keep insertion order.
    fn insert_index(&self, position: Position) -> usize {
        self.cells
            .partition_point(|entry| entry.cell.position() <= position)
    }

    /// Index of the region with the latest start that contains `position`.
    fn innermost_region(&self, position: Position, exclude: Option<ScopeId>) -> Option<usize> {
        self.regions
            .iter()
            .enumerate()
            .filter(|(_, region)| Some(region.id) != exclude && region.span.contains(position))
            .max_by_key(|(_, region)| (region.span.start, std::cmp::Reverse(region.span.end)))
            .map(|(index, _)| index)
    }

    /// Re-parents region scopes after the region set changed, then re-homes cells.
    ///
    /// A region gets a fresh [`Scope`] only if it is new or its parent chain changed.
    fn rebuild_scopes(&mut self, created: Option<ScopeId>) {
        // Outer regions first, so parents are settled before their children.
        self.regions
            .sort_by_key(|region| (region.span.start, std::cmp::Reverse(region.span.end)));

        let mut rebuilt: HashSet<ScopeId> = HashSet::new();
        for index in 0..self.regions.len() {
            let region = &self.regions[index];
            let start = region.span.start.unwrap_or_else(Position::origin);
            let parent = self
                .innermost_region(start, Some(region.id))
                .filter(|&candidate| candidate < index)
                .map(|candidate| self.regions[candidate].id);
            let stale = created == Some(region.id)
                || region.parent != parent
                || parent.is_some_and(|parent| rebuilt.contains(&parent));
            if !stale {
                continue;
            }

            let parent_scope = parent
                .and_then(|parent| self.scope(parent).cloned())
                .unwrap_or_else(|| self.root.clone());
            let scope = parent_scope.child(region.name.clone(), start, region.closed);
            let region = &mut self.regions[index];
            region.parent = parent;
            region.scope = scope;
            rebuilt.insert(region.id);
        }

        for entry in &self.cells {
            let position = entry.cell.position();
            entry.cell.set_scope(Some(self.scope_at(position)));
        }
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("options", &self.options)
            .field("cells", &self.cells.len())
            .field("scopes", &self.regions.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::CommandQueue;

    fn document() -> Document {
        Document::new(DocumentOptions::default(), Rc::new(CommandQueue::new()))
    }

    #[test]
    fn cells_stay_in_document_order() {
        let mut doc = document();
        let low = doc.create_cell(Position::new(0.0, 40.0), Expr::number(1.0));
        let high = doc.create_cell(Position::new(0.0, 0.0), Expr::number(2.0));
        let ids: Vec<CellId> = doc.cells().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![high, low]);

        doc.move_cell(high, Position::new(0.0, 80.0)).unwrap();
        let ids: Vec<CellId> = doc.cells().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![low, high]);
    }

    #[test]
    fn hit_test_prefers_later_cells() {
        let mut doc = document();
        let first = doc.create_cell(Position::new(0.0, 0.0), Expr::number(1.0));
        let second = doc.create_cell(Position::new(10.0, 10.0), Expr::number(2.0));
        assert_eq!(doc.element_at(Position::new(15.0, 15.0)), Some(second));
        assert_eq!(doc.element_at(Position::new(5.0, 5.0)), Some(first));
        assert_eq!(doc.element_at(Position::new(100.0, 100.0)), None);

        doc.set_cell_size(first, Size::new(200.0, 200.0)).unwrap();
        assert_eq!(doc.element_at(Position::new(100.0, 100.0)), Some(first));
    }

    #[test]
    fn snapping_uses_grid_cell_size() {
        let doc = document();
        assert_eq!(
            doc.snap_to_grid(Position::new(29.0, 31.0)),
            Position::new(20.0, 40.0)
        );
    }

    #[test]
    fn unknown_ids_are_errors() {
        let mut doc = document();
        let id = doc.create_cell(Position::origin(), Expr::number(1.0));
        doc.delete_cell(id).unwrap();
        assert!(matches!(
            doc.delete_cell(id),
            Err(DocumentError::UnknownCell(missing)) if missing == id
        ));
        assert!(matches!(
            doc.create_scope("bad", Position::new(0.0, 5.0), Position::new(0.0, 5.0), false),
            Err(DocumentError::InvalidRegion { .. })
        ));
    }
}
