//! Table descriptors: column layout and operation permissions.
//!
//! Grounded on the `TableInfo` nested class and the constructor parse
//! loop of `Datafile.h::Datafile()` in original_source, which consumes
//! the same `<COL> -> "type:width"` / `COLUMN_ORDER` / permission-list
//! map used here.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::{Error, Result};

/// Fixed size of the per-row control header: flag (1) + reserved (1)
/// + transaction id (2), little-endian.
pub const CONTROL_DATA_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    String,
    Password,
    DateTime,
}

impl ColumnType {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "string" => Ok(ColumnType::String),
            "password" => Ok(ColumnType::Password),
            "datetime" => Ok(ColumnType::DateTime),
            other => Err(Error::Parse(format!("unknown column type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Select,
}

impl Operation {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Some(Operation::Insert),
            "UPDATE" => Some(Operation::Update),
            "DELETE" => Some(Operation::Delete),
            "SELECT" => Some(Operation::Select),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
    pub width: usize,
    pub offset: usize,
}

/// Immutable description of one table: ordered columns plus the
/// per-operation permission sets. Built once at table-open time and
/// never mutated afterward.
#[derive(Debug, Clone)]
pub struct TableDescriptor {
    columns: Vec<Column>,
    by_name: HashMap<String, usize>,
    permissions: HashMap<Operation, HashSet<String>>,
}

impl TableDescriptor {
    /// Parses the raw table-definition map loaded from a table's schema file.
    pub fn parse(definition: &BTreeMap<String, String>) -> Result<Self> {
        let mut permissions: HashMap<Operation, HashSet<String>> = HashMap::new();
        let mut order: HashMap<String, usize> = HashMap::new();
        let mut raw_columns: Vec<(String, String, usize)> = Vec::new();

        for (key, value) in definition {
            if let Some(op) = Operation::parse(key) {
                let users = split_csv(value);
                permissions.entry(op).or_default().extend(users);
            } else if key.eq_ignore_ascii_case("COLUMN_ORDER") {
                for (idx, name) in split_csv(value).into_iter().enumerate() {
                    order.insert(name, idx);
                }
            } else {
                for c in value.chars() {
                    if !(c.is_ascii_alphanumeric() || c == '_' || c == ':') {
                        return Err(Error::Parse(format!("cannot use '{c}' in column definition")));
                    }
                }
                let (ty_str, width_str) = value
                    .split_once(':')
                    .ok_or_else(|| Error::Parse(format!("column '{key}' is missing ':'")))?;
                let width: i64 = width_str
                    .parse()
                    .map_err(|_| Error::Parse(format!("column '{key}' has a non-numeric width")))?;
                if width <= 0 {
                    return Err(Error::Parse("column size cannot be zero.".to_string()));
                }
                raw_columns.push((key.to_ascii_lowercase(), ty_str.to_ascii_lowercase(), width as usize));
            }
        }

        for (name, _, _) in &raw_columns {
            if !order.contains_key(name) {
                return Err(Error::Parse(format!("column '{name}' is missing from COLUMN_ORDER")));
            }
        }
        raw_columns.sort_by_key(|(name, _, _)| order[name]);

        let mut columns = Vec::with_capacity(raw_columns.len());
        let mut by_name = HashMap::with_capacity(raw_columns.len());
        let mut offset: usize = 0;
        for (name, ty_str, width) in raw_columns {
            let ty = ColumnType::parse(&ty_str)?;
            by_name.insert(name.clone(), columns.len());
            columns.push(Column { name, ty, width, offset });
            offset = offset
                .checked_add(width)
                .ok_or(Error::Overflow)?;
        }

        Ok(Self { columns, by_name, permissions })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Result<&Column> {
        self.by_name
            .get(name)
            .map(|&i| &self.columns[i])
            .ok_or_else(|| Error::UnknownColumn(name.to_string()))
    }

    pub fn is_permitted(&self, operation: Operation, user: &str) -> bool {
        self.permissions
            .get(&operation)
            .map(|users| users.contains(user))
            .unwrap_or(false)
    }

    /// Total width of all data columns (excludes the control header).
    pub fn column_size_total(&self) -> usize {
        self.columns.iter().map(|c| c.width).sum()
    }

    /// Fixed row width on disk: control header + every column.
    pub fn row_width(&self) -> usize {
        CONTROL_DATA_SIZE + self.column_size_total()
    }

    pub fn default_value(&self, column: &Column) -> Result<Vec<u8>> {
        match column.ty {
            ColumnType::String => Ok(vec![0u8; column.width]),
            ColumnType::Password => Err(Error::Parse("password cannot have default value".to_string())),
            ColumnType::DateTime => {
                let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
                Ok(pad_or_truncate(now.as_bytes(), column.width))
            }
        }
    }

    /// Type-specific equality used by `where`-clause matching: strings
    /// compare ignoring a trailing run of zero bytes on the longer
    /// side; password and datetime compare byte-for-byte.
    pub fn values_equal(&self, column: &Column, lhs: &[u8], rhs: &[u8]) -> Result<bool> {
        match column.ty {
            ColumnType::String => Ok(strip_trailing_zeros(lhs) == strip_trailing_zeros(rhs)),
            ColumnType::Password | ColumnType::DateTime => Ok(lhs == rhs),
        }
    }
}

fn pad_or_truncate(bytes: &[u8], width: usize) -> Vec<u8> {
    let mut v = bytes.to_vec();
    v.truncate(width);
    v.resize(width, 0);
    v
}

fn strip_trailing_zeros(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|&b| b != 0).map(|i| i + 1).unwrap_or(0);
    &bytes[..end]
}

fn split_csv(s: &str) -> Vec<String> {
    s.split(',')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_def() -> BTreeMap<String, String> {
        let mut m = BTreeMap::new();
        m.insert("ORDER_NAME".to_string(), "string:32".to_string());
        m.insert("CUSTOMER_NAME".to_string(), "string:64".to_string());
        m.insert("PRODUCT_NAME".to_string(), "string:64".to_string());
        m.insert(
            "COLUMN_ORDER".to_string(),
            "ORDER_NAME,CUSTOMER_NAME,PRODUCT_NAME".to_string(),
        );
        m.insert("INSERT".to_string(), "admin".to_string());
        m.insert("SELECT".to_string(), "admin,guest".to_string());
        m
    }

    #[test]
    fn parses_offsets_in_column_order() {
        let desc = TableDescriptor::parse(&order_def()).unwrap();
        assert_eq!(desc.column("order_name").unwrap().offset, 0);
        assert_eq!(desc.column("customer_name").unwrap().offset, 32);
        assert_eq!(desc.column("product_name").unwrap().offset, 96);
        assert_eq!(desc.column_size_total(), 160);
        assert_eq!(desc.row_width(), 164);
    }

    #[test]
    fn permission_sets_are_enforced() {
        let desc = TableDescriptor::parse(&order_def()).unwrap();
        assert!(desc.is_permitted(Operation::Insert, "admin"));
        assert!(!desc.is_permitted(Operation::Insert, "guest"));
        assert!(desc.is_permitted(Operation::Select, "guest"));
        assert!(!desc.is_permitted(Operation::Delete, "admin"));
    }

    #[test]
    fn rejects_non_positive_width() {
        let mut m = BTreeMap::new();
        m.insert("A".to_string(), "string:0".to_string());
        m.insert("COLUMN_ORDER".to_string(), "A".to_string());
        assert!(TableDescriptor::parse(&m).is_err());
    }

    #[test]
    fn string_equality_ignores_trailing_zeros() {
        let desc = TableDescriptor::parse(&order_def()).unwrap();
        let col = desc.column("order_name").unwrap();
        let mut padded = b"order1".to_vec();
        padded.resize(32, 0);
        assert!(desc.values_equal(col, b"order1", &padded).unwrap());
    }

    proptest::proptest! {
        #[test]
        fn string_equality_is_unaffected_by_padding_width(bytes in proptest::collection::vec(1u8..=255, 0..32)) {
            let desc = TableDescriptor::parse(&order_def()).unwrap();
            let col = desc.column("order_name").unwrap();
            let mut padded = bytes.clone();
            padded.resize(32, 0);
            proptest::prop_assert!(desc.values_equal(col, &bytes, &padded).unwrap());
        }
    }
}
