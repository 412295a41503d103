//! Result-set descriptors and per-response token state.

use std::collections::BTreeMap;

use tidewire_proto::token::Done;
use tidewire_proto::value::Value;
use tidewire_stream::tokens::{ColumnMeta, ReturnValue};

/// The current result set: column descriptors plus the one-row buffer.
///
/// Column type info is fixed for the lifetime of the result set; the row
/// buffer always has one slot per column.
#[derive(Debug, Default)]
pub struct ResultSet {
    /// Columns as announced by COLMETADATA.
    pub columns: Vec<ColumnMeta>,
    /// The most recently read row, drained by the caller.
    pub row: Option<Vec<Value>>,
}

impl ResultSet {
    /// Reset for a new COLMETADATA.
    pub fn reset(&mut self, columns: Vec<ColumnMeta>) {
        self.columns = columns;
        self.row = None;
    }

    /// Take the buffered row.
    pub fn take_row(&mut self) -> Option<Vec<Value>> {
        self.row.take()
    }
}

/// Token-level state accumulated while reading one response.
#[derive(Debug, Default)]
pub struct TokenState {
    /// A ROW/NBCROW may still follow in the current result set.
    pub more_rows: bool,
    /// RETURNSTATUS was seen.
    pub has_status: bool,
    /// The stored-procedure return value.
    pub return_status: i32,
    /// Output parameters by wire ordinal.
    pub output_params: BTreeMap<u16, ReturnValue>,
    /// Counts RETURNVALUE tokens; stands in for the ordinal before 7.2.
    pub return_value_index: u16,
    /// `find_return_status` ran; further row fetches fail fast.
    pub skipped_to_status: bool,
    /// The last DONE/DONEPROC/DONEINPROC seen.
    pub last_done: Option<Done>,
}

impl TokenState {
    /// Reset at the start of a new request.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
