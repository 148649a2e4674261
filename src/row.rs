//! Owned result rows and the tagged query outcome.

use std::rc::Rc;

use crate::col::Column;
use crate::constant::ServerStatusFlags;
use crate::protocol::response::OkPacket;
use crate::value::SqlValue;

/// Status half of an OK response: affected rows, last insert id, flags.
#[derive(Debug, Clone)]
pub struct OkInfo {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status: ServerStatusFlags,
    pub warnings: u16,
}

impl From<OkPacket> for OkInfo {
    fn from(ok: OkPacket) -> Self {
        Self {
            affected_rows: ok.affected_rows,
            last_insert_id: ok.last_insert_id,
            status: ok.status,
            warnings: ok.warnings,
        }
    }
}

/// What a query produced: a plain OK or a result set. Server errors are
/// raised as [`crate::Error::Server`], not represented here.
#[derive(Debug, Clone)]
pub enum QueryOutcome {
    Done(OkInfo),
    Rows(ResultSet),
}

impl QueryOutcome {
    /// The result set, or an empty one for plain-OK outcomes.
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            QueryOutcome::Done(_) => Vec::new(),
            QueryOutcome::Rows(set) => set.rows,
        }
    }

    pub fn ok_info(&self) -> Option<&OkInfo> {
        match self {
            QueryOutcome::Done(info) => Some(info),
            QueryOutcome::Rows(_) => None,
        }
    }
}

/// A complete, owned result set.
#[derive(Debug, Clone)]
pub struct ResultSet {
    pub columns: Rc<[Column]>,
    pub rows: Vec<Row>,
}

impl ResultSet {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

/// One row; values are indexed positionally or by column name.
#[derive(Debug, Clone)]
pub struct Row {
    pub(crate) columns: Rc<[Column]>,
    pub(crate) values: Vec<SqlValue>,
}

impl Row {
    pub(crate) fn new(columns: Rc<[Column]>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn get(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    pub fn get_named(&self, name: &str) -> Option<&SqlValue> {
        let index = self.columns.iter().position(|c| c.name == name)?;
        self.values.get(index)
    }

    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }
}
