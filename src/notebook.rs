//! Notebook documents and output stripping.
//!
//! Notebooks are kept as raw JSON values so that fields this tool does not
//! know about are written back exactly as they were read. Only `outputs` and
//! the execution counter of cells are ever rewritten.

use clap::ValueEnum;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum NotebookError {
    #[error("Input is not valid JSON (at `{path}`). {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Input is not a notebook: {0}")]
    NotANotebook(&'static str),
    #[error("Cell {0} is not a JSON object")]
    MalformedCell(usize),
}

pub type NotebookResult<T> = Result<T, NotebookError>;

/// Which cells get their outputs and execution counters cleared.
#[derive(
    ValueEnum, Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, Default, PartialEq, Eq,
)]
#[serde(rename_all = "kebab-case")]
pub enum StripScope {
    /// Only code cells, the way `nbconvert`'s output clearing works
    #[default]
    CodeCells,
    /// Every cell regardless of type, the way a `.cells[]` query assignment works
    AllCells,
}

/// Where the cell list lives inside the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    /// nbformat 4 and later: a top-level `cells` array.
    Cells,
    /// nbformat 3: `worksheets[].cells`, counters stored as `prompt_number`.
    Worksheets,
}

impl Layout {
    fn counter_key(self) -> &'static str {
        match self {
            Layout::Cells => "execution_count",
            Layout::Worksheets => "prompt_number",
        }
    }
}

/// Counts of what a strip pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StripReport {
    pub cells: usize,
    pub outputs_removed: usize,
    pub counts_cleared: usize,
}

impl StripReport {
    pub fn changed(&self) -> bool {
        self.outputs_removed > 0 || self.counts_cleared > 0
    }
}

/// Read-only view of how much output a notebook still carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Inspection {
    pub cells: usize,
    pub dirty_cells: usize,
    pub outputs: usize,
    pub counts: usize,
}

impl Inspection {
    pub fn is_clean(&self) -> bool {
        self.dirty_cells == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notebook {
    doc: Value,
    layout: Layout,
}

impl Notebook {
    /// Parse raw file bytes into a notebook.
    #[tracing::instrument(level = "trace", skip(bytes), fields(len = bytes.len()))]
    pub fn parse(bytes: &[u8]) -> NotebookResult<Self> {
        let mut de = serde_json::Deserializer::from_slice(bytes);
        let doc: Value = serde_path_to_error::deserialize(&mut de).map_err(|e| {
            let path = e.path().to_string();
            NotebookError::Json {
                path,
                source: e.into_inner(),
            }
        })?;
        de.end().map_err(|source| NotebookError::Json {
            path: ".".to_string(),
            source,
        })?;
        Self::from_value(doc)
    }

    /// Validate an already parsed document.
    pub fn from_value(doc: Value) -> NotebookResult<Self> {
        let root = doc
            .as_object()
            .ok_or(NotebookError::NotANotebook("the document root is not an object"))?;

        let layout = if root.contains_key("cells") {
            let cells = root
                .get("cells")
                .and_then(Value::as_array)
                .ok_or(NotebookError::NotANotebook("`cells` is not an array"))?;
            check_cells(cells, 0)?;
            Layout::Cells
        } else if let Some(worksheets) = root.get("worksheets") {
            let worksheets = worksheets
                .as_array()
                .ok_or(NotebookError::NotANotebook("`worksheets` is not an array"))?;
            let mut offset = 0;
            for sheet in worksheets {
                let cells = sheet
                    .get("cells")
                    .and_then(Value::as_array)
                    .ok_or(NotebookError::NotANotebook("a worksheet has no `cells` array"))?;
                check_cells(cells, offset)?;
                offset += cells.len();
            }
            Layout::Worksheets
        } else {
            return Err(NotebookError::NotANotebook(
                "neither `cells` nor `worksheets` is present",
            ));
        };

        debug!(?layout, "Parsed notebook");
        Ok(Self { doc, layout })
    }

    /// Declared major format version, if any.
    pub fn nbformat(&self) -> Option<u64> {
        self.doc.get("nbformat").and_then(Value::as_u64)
    }

    pub fn as_value(&self) -> &Value {
        &self.doc
    }

    /// Clear outputs and execution counters for every cell in `scope`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn strip(&mut self, scope: StripScope) -> StripReport {
        let layout = self.layout;
        let counter_key = layout.counter_key();
        let mut report = StripReport::default();

        for cell in self.cells_mut() {
            report.cells += 1;
            if !in_scope(cell, scope) {
                continue;
            }

            report.outputs_removed += output_count(cell.get("outputs"));
            cell.insert("outputs".to_string(), Value::Array(Vec::new()));

            let had_count = cell.get(counter_key).is_some_and(|c| !c.is_null());
            if had_count {
                report.counts_cleared += 1;
            }
            match layout {
                Layout::Cells => {
                    cell.insert(counter_key.to_string(), Value::Null);
                }
                Layout::Worksheets => {
                    cell.shift_remove(counter_key);
                }
            }
        }

        trace!(?report, "Stripped notebook");
        report
    }

    /// Count cells in `scope` that still carry outputs or execution counters.
    pub fn inspect(&self, scope: StripScope) -> Inspection {
        let counter_key = self.layout.counter_key();
        let mut inspection = Inspection::default();

        for cell in self.cells() {
            inspection.cells += 1;
            if !in_scope(cell, scope) {
                continue;
            }
            let outputs = output_count(cell.get("outputs"));
            let counted = cell.get(counter_key).is_some_and(|c| !c.is_null());
            inspection.outputs += outputs;
            inspection.counts += usize::from(counted);
            if outputs > 0 || counted {
                inspection.dirty_cells += 1;
            }
        }

        inspection
    }

    pub fn is_clean(&self, scope: StripScope) -> bool {
        self.inspect(scope).is_clean()
    }

    fn cells(&self) -> Box<dyn Iterator<Item = &Map<String, Value>> + '_> {
        match self.layout {
            Layout::Cells => Box::new(
                self.doc["cells"]
                    .as_array()
                    .into_iter()
                    .flatten()
                    .filter_map(Value::as_object),
            ),
            Layout::Worksheets => Box::new(
                self.doc["worksheets"]
                    .as_array()
                    .into_iter()
                    .flatten()
                    .filter_map(|sheet| sheet.get("cells").and_then(Value::as_array))
                    .flatten()
                    .filter_map(Value::as_object),
            ),
        }
    }

    fn cells_mut(&mut self) -> Box<dyn Iterator<Item = &mut Map<String, Value>> + '_> {
        match self.layout {
            Layout::Cells => Box::new(
                self.doc
                    .get_mut("cells")
                    .and_then(Value::as_array_mut)
                    .into_iter()
                    .flatten()
                    .filter_map(Value::as_object_mut),
            ),
            Layout::Worksheets => Box::new(
                self.doc
                    .get_mut("worksheets")
                    .and_then(Value::as_array_mut)
                    .into_iter()
                    .flatten()
                    .filter_map(|sheet| sheet.get_mut("cells").and_then(Value::as_array_mut))
                    .flatten()
                    .filter_map(Value::as_object_mut),
            ),
        }
    }
}

fn check_cells(cells: &[Value], offset: usize) -> NotebookResult<()> {
    match cells.iter().position(|cell| !cell.is_object()) {
        Some(index) => Err(NotebookError::MalformedCell(offset + index)),
        None => Ok(()),
    }
}

/// Outputs held by a cell. Anything but an array counts as one malformed output.
fn output_count(outputs: Option<&Value>) -> usize {
    match outputs {
        None => 0,
        Some(Value::Array(items)) => items.len(),
        Some(_) => 1,
    }
}

fn in_scope(cell: &Map<String, Value>, scope: StripScope) -> bool {
    match scope {
        StripScope::AllCells => true,
        StripScope::CodeCells => cell.get("cell_type").and_then(Value::as_str) == Some("code"),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// A small nbformat 4 notebook with one executed code cell, one markdown
    /// cell and one never-run code cell.
    pub(crate) const EXECUTED: &str = r##"{
 "cells": [
  {
   "cell_type": "code",
   "execution_count": 3,
   "id": "a1",
   "metadata": {"tags": ["keep"]},
   "outputs": [
    {"name": "stdout", "output_type": "stream", "text": ["1.50\n"]},
    {"data": {"text/plain": ["2"]}, "execution_count": 3, "metadata": {}, "output_type": "execute_result"}
   ],
   "source": ["print(1.50)\n", "1 + 1"]
  },
  {
   "cell_type": "markdown",
   "id": "b2",
   "metadata": {},
   "source": ["# Überschrift"]
  },
  {
   "cell_type": "code",
   "execution_count": null,
   "id": "c3",
   "metadata": {},
   "outputs": [],
   "source": []
  }
 ],
 "metadata": {"kernelspec": {"display_name": "Python 3", "language": "python", "name": "python3"}},
 "nbformat": 4,
 "nbformat_minor": 5
}
"##;

    /// nbformat 3 layout with worksheets and prompt numbers.
    pub(crate) const WORKSHEETS: &str = r##"{
 "metadata": {"name": ""},
 "nbformat": 3,
 "nbformat_minor": 0,
 "worksheets": [
  {
   "cells": [
    {"cell_type": "code", "collapsed": false, "input": ["x = 1"], "language": "python", "metadata": {}, "outputs": [{"output_type": "pyout", "prompt_number": 1, "text": ["1"]}], "prompt_number": 1},
    {"cell_type": "markdown", "metadata": {}, "source": ["text"]}
   ],
   "metadata": {}
  }
 ]
}
"##;
}

#[cfg(test)]
mod tests {
    use super::fixtures::{EXECUTED, WORKSHEETS};
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn code_scope_clears_only_code_cells() {
        let mut nb = Notebook::parse(EXECUTED.as_bytes()).unwrap();
        let report = nb.strip(StripScope::CodeCells);
        assert_eq!(
            report,
            StripReport {
                cells: 3,
                outputs_removed: 2,
                counts_cleared: 1,
            }
        );

        let doc = nb.as_value().clone();
        assert_eq!(doc["cells"][0]["outputs"], json!([]));
        assert_eq!(doc["cells"][0]["execution_count"], Value::Null);
        assert_eq!(doc["cells"][0]["metadata"], json!({"tags": ["keep"]}));
        assert_eq!(doc["cells"][0]["source"], json!(["print(1.50)\n", "1 + 1"]));
        let markdown = doc["cells"][1].as_object().unwrap();
        assert!(!markdown.contains_key("outputs"));
        assert!(!markdown.contains_key("execution_count"));
    }

    #[test]
    fn all_scope_adds_fields_to_every_cell() {
        let mut nb = Notebook::parse(EXECUTED.as_bytes()).unwrap();
        nb.strip(StripScope::AllCells);
        let doc = nb.as_value().clone();
        for cell in doc["cells"].as_array().unwrap() {
            assert_eq!(cell["outputs"], json!([]));
            assert_eq!(cell["execution_count"], Value::Null);
        }
        // Missing keys are appended after the existing ones.
        let keys: Vec<&str> = doc["cells"][1]
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(
            keys,
            ["cell_type", "id", "metadata", "source", "outputs", "execution_count"]
        );
    }

    #[test]
    fn existing_keys_keep_their_position() {
        let mut nb = Notebook::parse(EXECUTED.as_bytes()).unwrap();
        nb.strip(StripScope::CodeCells);
        let keys: Vec<&str> = nb.as_value()["cells"][0]
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(
            keys,
            ["cell_type", "execution_count", "id", "metadata", "outputs", "source"]
        );
    }

    #[test]
    fn stripping_twice_changes_nothing_the_second_time() {
        let mut nb = Notebook::parse(EXECUTED.as_bytes()).unwrap();
        assert!(nb.strip(StripScope::CodeCells).changed());
        let once = nb.clone();
        assert!(!nb.strip(StripScope::CodeCells).changed());
        assert_eq!(nb, once);
    }

    #[test]
    fn inspection_tracks_dirty_cells() {
        let nb = Notebook::parse(EXECUTED.as_bytes()).unwrap();
        let inspection = nb.inspect(StripScope::CodeCells);
        assert_eq!(
            inspection,
            Inspection {
                cells: 3,
                dirty_cells: 1,
                outputs: 2,
                counts: 1,
            }
        );
        assert!(!nb.is_clean(StripScope::AllCells));
    }

    #[test]
    fn malformed_outputs_count_as_dirty() {
        let mut nb = Notebook::from_value(json!({
            "nbformat": 4,
            "nbformat_minor": 5,
            "metadata": {},
            "cells": [{
                "cell_type": "code",
                "execution_count": null,
                "metadata": {},
                "outputs": {},
                "source": "x"
            }]
        }))
        .unwrap();
        assert!(!nb.is_clean(StripScope::CodeCells));
        let report = nb.strip(StripScope::CodeCells);
        assert_eq!(report.outputs_removed, 1);
        assert!(report.changed());
        assert_eq!(nb.as_value()["cells"][0]["outputs"], json!([]));
        assert!(nb.is_clean(StripScope::CodeCells));
    }

    #[test]
    fn worksheets_layout_drops_prompt_numbers() {
        let mut nb = Notebook::parse(WORKSHEETS.as_bytes()).unwrap();
        assert_eq!(nb.nbformat(), Some(3));
        let report = nb.strip(StripScope::CodeCells);
        assert_eq!(report.outputs_removed, 1);
        assert_eq!(report.counts_cleared, 1);

        let cell = &nb.as_value()["worksheets"][0]["cells"][0];
        assert_eq!(cell["outputs"], json!([]));
        assert!(cell.get("prompt_number").is_none());
        assert_eq!(cell["collapsed"], json!(false));
        assert!(nb.is_clean(StripScope::CodeCells));
    }

    #[test]
    fn rejects_documents_that_are_not_notebooks() {
        assert!(matches!(
            Notebook::parse(b"[1, 2, 3]"),
            Err(NotebookError::NotANotebook(_))
        ));
        assert!(matches!(
            Notebook::parse(br#"{"metadata": {}}"#),
            Err(NotebookError::NotANotebook(_))
        ));
        assert!(matches!(
            Notebook::parse(br#"{"cells": {}}"#),
            Err(NotebookError::NotANotebook(_))
        ));
    }

    #[test]
    fn rejects_non_object_cells_with_their_index() {
        let err = Notebook::parse(br#"{"cells": [{}, "oops"]}"#).unwrap_err();
        assert!(matches!(err, NotebookError::MalformedCell(1)));
    }

    #[test]
    fn rejects_invalid_json_and_trailing_garbage() {
        assert!(matches!(
            Notebook::parse(b"{\"cells\": [}"),
            Err(NotebookError::Json { .. })
        ));
        assert!(matches!(
            Notebook::parse(b"{\"cells\": []} trailing"),
            Err(NotebookError::Json { .. })
        ));
    }
}
