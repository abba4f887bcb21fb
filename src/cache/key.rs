//! Composite cache keys.
//!
//! A `CacheKey` identifies one logical query invocation: statement id, row
//! bounds, SQL text, every input parameter value and the environment id. It
//! keeps a running hash and checksum as fast-reject filters; the ordered list
//! of elements is the ground truth for equality.
//!
//! Element hashes are fixed functions of the value (no per-process random
//! state), so two processes build identical keys for identical invocations.

use crate::models::QueryParam;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

const DEFAULT_MULTIPLIER: i32 = 37;
const DEFAULT_HASHCODE: i32 = 17;
const NULL_HASHCODE: i32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheKey {
    multiplier: i32,
    hashcode: i32,
    checksum: i64,
    count: i32,
    elements: Vec<QueryParam>,
}

impl CacheKey {
    pub fn new() -> Self {
        Self {
            multiplier: DEFAULT_MULTIPLIER,
            hashcode: DEFAULT_HASHCODE,
            checksum: 0,
            count: 0,
            elements: Vec::new(),
        }
    }

    /// Build a key from a sequence of values, in order.
    pub fn from_values<I, T>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<QueryParam>,
    {
        let mut key = Self::new();
        key.update_all(values);
        key
    }

    /// Append a value. Arrays are appended element by element.
    pub fn update(&mut self, value: impl Into<QueryParam>) {
        match value.into() {
            QueryParam::Array(items) => {
                for item in items {
                    self.push(item);
                }
            }
            other => self.push(other),
        }
    }

    pub fn update_all<I, T>(&mut self, values: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<QueryParam>,
    {
        for value in values {
            self.update(value);
        }
    }

    fn push(&mut self, element: QueryParam) {
        let base = element_hash(&element);
        self.count = self.count.wrapping_add(1);
        self.checksum = self.checksum.wrapping_add(base as i64);
        self.hashcode = self
            .multiplier
            .wrapping_mul(self.hashcode)
            .wrapping_add(base.wrapping_mul(self.count));
        self.elements.push(element);
    }

    /// Number of elements appended so far.
    pub fn update_count(&self) -> usize {
        self.elements.len()
    }

    pub fn hashcode(&self) -> i32 {
        self.hashcode
    }

    pub fn checksum(&self) -> i64 {
        self.checksum
    }

    pub fn elements(&self) -> &[QueryParam] {
        &self.elements
    }
}

impl Default for CacheKey {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        if self.hashcode != other.hashcode
            || self.checksum != other.checksum
            || self.count != other.count
        {
            return false;
        }
        self.elements
            .iter()
            .zip(&other.elements)
            .all(|(a, b)| element_eq(a, b))
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_i32(self.hashcode);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hashcode, self.checksum)?;
        for element in &self.elements {
            write!(f, ":{}", element)?;
        }
        Ok(())
    }
}

/// Floats compare by bit pattern so that equality agrees with the hash.
fn element_eq(a: &QueryParam, b: &QueryParam) -> bool {
    match (a, b) {
        (QueryParam::Float(x), QueryParam::Float(y)) => x.to_bits() == y.to_bits(),
        (QueryParam::Array(xs), QueryParam::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| element_eq(x, y))
        }
        _ => a == b,
    }
}

fn element_hash(value: &QueryParam) -> i32 {
    match value {
        QueryParam::Null => NULL_HASHCODE,
        QueryParam::Bool(true) => 1231,
        QueryParam::Bool(false) => 1237,
        QueryParam::Int(v) => fold_i64(*v),
        QueryParam::Float(v) => fold_i64(v.to_bits() as i64),
        QueryParam::String(s) => s
            .encode_utf16()
            .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(unit as i32)),
        QueryParam::Bytes(bytes) => bytes.iter().fold(1i32, |h, b| {
            h.wrapping_mul(31).wrapping_add(*b as i8 as i32)
        }),
        QueryParam::Array(items) => items
            .iter()
            .fold(1i32, |h, item| h.wrapping_mul(31).wrapping_add(element_hash(item))),
    }
}

fn fold_i64(v: i64) -> i32 {
    (v ^ ((v as u64) >> 32) as i64) as i32
}
