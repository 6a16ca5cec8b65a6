// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The two benchmark entities and the values the harness writes into them.
//!
//! Entity `A` is the parent record, entity `B` the child that points back to
//! `A` through the nullable `aid` column. Every value the harness writes is a
//! pure function of the record id, so any read can be checked without
//! remembering what was written.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub type Id = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Entity {
    A,
    B,
}

impl Entity {
    pub const ALL: [Entity; 2] = [Entity::A, Entity::B];

    pub fn table_name(self) -> &'static str {
        match self {
            Entity::A => "a",
            Entity::B => "b",
        }
    }

    pub fn has_column(self, column: Column) -> bool {
        match column {
            Column::Cint | Column::Clong | Column::Cfloat | Column::Cdouble => true,
            Column::Aid | Column::Cvarbinary | Column::Cvarchar => self == Entity::B,
        }
    }

    /// Columns in storage order, id excluded.
    pub fn columns(self) -> &'static [Column] {
        match self {
            Entity::A => &Column::SCALARS,
            Entity::B => &Column::ALL,
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::A => write!(f, "A"),
            Entity::B => write!(f, "B"),
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Column {
    Cint = 0,
    Clong = 1,
    Cfloat = 2,
    Cdouble = 3,
    Aid = 4,
    Cvarbinary = 5,
    Cvarchar = 6,
}

impl Column {
    pub const SCALARS: [Column; 4] = [Column::Cint, Column::Clong, Column::Cfloat, Column::Cdouble];

    pub const ALL: [Column; 7] = [
        Column::Cint,
        Column::Clong,
        Column::Cfloat,
        Column::Cdouble,
        Column::Aid,
        Column::Cvarbinary,
        Column::Cvarchar,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Column::Cint => "cint",
            Column::Clong => "clong",
            Column::Cfloat => "cfloat",
            Column::Cdouble => "cdouble",
            Column::Aid => "aid",
            Column::Cvarbinary => "cvarbinary",
            Column::Cvarchar => "cvarchar",
        }
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Bytes(Vec<u8>),
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::Text(v) => write!(f, "<{} chars>", v.chars().count()),
        }
    }
}

/// An owned record. Columns not fetched or stored as NULL are `None`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    pub id: Id,
    pub cint: Option<i32>,
    pub clong: Option<i64>,
    pub cfloat: Option<f32>,
    pub cdouble: Option<f64>,
    pub aid: Option<Id>,
    pub cvarbinary: Option<Vec<u8>>,
    pub cvarchar: Option<String>,
}

impl Row {
    pub fn new(id: Id) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn get(&self, column: Column) -> Value {
        match column {
            Column::Cint => self.cint.map_or(Value::Null, Value::Int),
            Column::Clong => self.clong.map_or(Value::Null, Value::Long),
            Column::Cfloat => self.cfloat.map_or(Value::Null, Value::Float),
            Column::Cdouble => self.cdouble.map_or(Value::Null, Value::Double),
            Column::Aid => self.aid.map_or(Value::Null, Value::Int),
            Column::Cvarbinary => self
                .cvarbinary
                .as_ref()
                .map_or(Value::Null, |v| Value::Bytes(v.clone())),
            Column::Cvarchar => self
                .cvarchar
                .as_ref()
                .map_or(Value::Null, |v| Value::Text(v.clone())),
        }
    }

    pub fn set(&mut self, column: Column, value: Value) -> Result<(), StoreError> {
        match (column, value) {
            (Column::Cint, Value::Int(v)) => self.cint = Some(v),
            (Column::Cint, Value::Null) => self.cint = None,
            (Column::Clong, Value::Long(v)) => self.clong = Some(v),
            (Column::Clong, Value::Null) => self.clong = None,
            (Column::Cfloat, Value::Float(v)) => self.cfloat = Some(v),
            (Column::Cfloat, Value::Null) => self.cfloat = None,
            (Column::Cdouble, Value::Double(v)) => self.cdouble = Some(v),
            (Column::Cdouble, Value::Null) => self.cdouble = None,
            (Column::Aid, Value::Int(v)) => self.aid = Some(v),
            (Column::Aid, Value::Null) => self.aid = None,
            (Column::Cvarbinary, Value::Bytes(v)) => self.cvarbinary = Some(v),
            (Column::Cvarbinary, Value::Null) => self.cvarbinary = None,
            (Column::Cvarchar, Value::Text(v)) => self.cvarchar = Some(v),
            (Column::Cvarchar, Value::Null) => self.cvarchar = None,
            (column, value) => return Err(StoreError::ColumnType { column, value }),
        }
        Ok(())
    }

    /// Copy of this row keeping only the id and `columns`.
    pub fn project(&self, columns: &[Column]) -> Row {
        let mut out = Row::new(self.id);
        for &column in columns {
            match column {
                Column::Cint => out.cint = self.cint,
                Column::Clong => out.clong = self.clong,
                Column::Cfloat => out.cfloat = self.cfloat,
                Column::Cdouble => out.cdouble = self.cdouble,
                Column::Aid => out.aid = self.aid,
                Column::Cvarbinary => out.cvarbinary.clone_from(&self.cvarbinary),
                Column::Cvarchar => out.cvarchar.clone_from(&self.cvarchar),
            }
        }
        out
    }
}

/// Which id-derived value a pass writes or expects in the scalar columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sign {
    Positive,
    Negative,
}

impl Sign {
    pub fn apply(self, id: Id) -> i32 {
        match self {
            Sign::Positive => id,
            Sign::Negative => id.wrapping_neg(),
        }
    }
}

/// The four scalar values for `id`, in [`Column::SCALARS`] order.
pub fn attr_values(id: Id, sign: Sign) -> Vec<Value> {
    let v = sign.apply(id);
    vec![
        Value::Int(v),
        Value::Long(i64::from(v)),
        Value::Float(v as f32),
        Value::Double(f64::from(v)),
    ]
}

pub fn varbinary_value(id: Id, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (id as usize).wrapping_add(i) as u8)
        .collect()
}

pub fn varchar_value(id: Id, len: usize) -> String {
    let start = id.rem_euclid(26) as usize;
    (0..len)
        .map(|i| char::from(b'a' + ((start + i) % 26) as u8))
        .collect()
}

/// `1, 10, 100, ...` up to and including `max`.
pub fn length_variants(max: usize) -> Vec<usize> {
    std::iter::successors(Some(1usize), |l| l.checked_mul(10))
        .take_while(|l| *l <= max)
        .collect()
}

/// The ids every operation of one run is exercised over: `0..n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySet {
    keys: Vec<Id>,
}

impl KeySet {
    pub fn new(n: usize) -> Self {
        let n = Id::try_from(n).unwrap_or(Id::MAX);
        Self {
            keys: (0..n).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn as_slice(&self) -> &[Id] {
        &self.keys
    }

    pub fn iter(&self) -> impl Iterator<Item = Id> + '_ {
        self.keys.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_series_is_truncated_at_max() {
        assert_eq!(length_variants(0), Vec::<usize>::new());
        assert_eq!(length_variants(1), vec![1]);
        assert_eq!(length_variants(100), vec![1, 10, 100]);
        assert_eq!(length_variants(999), vec![1, 10, 100]);
        assert_eq!(length_variants(1000), vec![1, 10, 100, 1000]);
    }

    #[test]
    fn attr_values_follow_sign() {
        assert_eq!(
            attr_values(7, Sign::Negative),
            vec![
                Value::Int(-7),
                Value::Long(-7),
                Value::Float(-7.0),
                Value::Double(-7.0)
            ]
        );
        assert_eq!(attr_values(0, Sign::Negative)[0], Value::Int(0));
    }

    #[test]
    fn set_rejects_mismatched_types() {
        let mut row = Row::new(1);
        row.set(Column::Cint, Value::Int(3)).unwrap();
        assert_eq!(row.cint, Some(3));
        assert!(row.set(Column::Cint, Value::Long(3)).is_err());
        row.set(Column::Cint, Value::Null).unwrap();
        assert_eq!(row.get(Column::Cint), Value::Null);
    }

    #[test]
    fn projection_drops_unrequested_columns() {
        let mut row = Row::new(4);
        row.cint = Some(4);
        row.aid = Some(4);
        row.cvarchar = Some(varchar_value(4, 3));
        let projected = row.project(&[Column::Aid]);
        assert_eq!(projected.id, 4);
        assert_eq!(projected.aid, Some(4));
        assert_eq!(projected.cint, None);
        assert_eq!(projected.cvarchar, None);
    }

    #[test]
    fn generated_content_is_deterministic() {
        assert_eq!(varchar_value(0, 3), "abc");
        assert_eq!(varchar_value(25, 3), "zab");
        assert_eq!(varbinary_value(254, 3), vec![254, 255, 0]);
        assert_eq!(varbinary_value(3, 0), Vec::<u8>::new());
    }
}
