//! Named collections of arrays sharing a leading batch shape
//!
//! A [`TensorDict`] is the record type exchanged between environments, policies and the
//! replay buffer. Borrowing accessors ([`get`](TensorDict::get), [`get_mut`](TensorDict::get_mut))
//! expose the stored arrays for in-place reads and writes, while every row-level accessor
//! ([`index`](TensorDict::index), [`select_rows`](TensorDict::select_rows),
//! [`slice`](TensorDict::slice), [`select`](TensorDict::select), [`exclude`](TensorDict::exclude))
//! returns an independent copy.

mod field;
mod tensor;

use std::{collections::BTreeMap, ops::Range};

pub use field::{Field, FieldKind};
pub use tensor::ToTensor;

use crate::error::{Error, Result};

/// A record of named [`Field`]s whose shapes all start with `batch_size`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TensorDict {
    fields: BTreeMap<String, Field>,
    batch_size: Vec<usize>,
}

impl TensorDict {
    /// Construct an empty record with the given batch shape
    pub fn new(batch_size: impl Into<Vec<usize>>) -> Self {
        Self {
            fields: BTreeMap::new(),
            batch_size: batch_size.into(),
        }
    }

    /// Construct a record from `(name, field)` pairs, validating every field against `batch_size`
    pub fn from_fields<K, I>(fields: I, batch_size: impl Into<Vec<usize>>) -> Result<Self>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Field)>,
    {
        let mut td = Self::new(batch_size);
        for (key, field) in fields {
            td.set(key, field)?;
        }
        Ok(td)
    }

    /// Builder-style [`set`](TensorDict::set)
    pub fn with(mut self, key: impl Into<String>, field: impl Into<Field>) -> Result<Self> {
        self.set(key, field.into())?;
        Ok(self)
    }

    pub fn batch_size(&self) -> &[usize] {
        &self.batch_size
    }

    /// Redeclare the batch shape; every field must still start with it
    pub fn set_batch_size(&mut self, batch_size: impl Into<Vec<usize>>) -> Result<()> {
        let batch_size = batch_size.into();
        for (key, field) in &self.fields {
            check_prefix(key, field, &batch_size)?;
        }
        self.batch_size = batch_size;
        Ok(())
    }

    /// Size of the leading batch axis, 0 when the record has no batch axis
    pub fn len(&self) -> usize {
        self.batch_size.first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Field)> {
        self.fields.iter().map(|(k, f)| (k.as_str(), f))
    }

    pub fn get(&self, key: &str) -> Option<&Field> {
        self.fields.get(key)
    }

    /// Like [`get`](TensorDict::get) but reports a missing key as an error
    pub fn try_get(&self, key: &str) -> Result<&Field> {
        self.get(key)
            .ok_or_else(|| Error::MissingKey(key.to_string()))
    }

    /// Mutable access to a stored field
    ///
    /// Writes land directly in this record. The leading batch axes must be left untouched.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Field> {
        self.fields.get_mut(key)
    }

    /// Insert or replace a field
    pub fn set(&mut self, key: impl Into<String>, field: Field) -> Result<()> {
        let key = key.into();
        check_prefix(&key, &field, &self.batch_size)?;
        self.fields.insert(key, field);
        Ok(())
    }

    /// Overwrite rows `rows` of an existing field in place with the rows of `values`
    pub fn set_at(&mut self, key: &str, values: &Field, rows: &[usize]) -> Result<()> {
        self.fields
            .get_mut(key)
            .ok_or_else(|| Error::MissingKey(key.to_string()))?
            .assign_rows(rows, values)
    }

    pub fn remove(&mut self, key: &str) -> Option<Field> {
        self.fields.remove(key)
    }

    /// Set every field of `other`, which must share this record's batch shape
    pub fn update(&mut self, other: TensorDict) -> Result<()> {
        for (key, field) in other.fields {
            self.set(key, field)?;
        }
        Ok(())
    }

    fn require_batch_axis(&self) -> Result<()> {
        if self.batch_size.is_empty() {
            return Err(Error::Shape(String::from(
                "record has no batch axis to index",
            )));
        }
        Ok(())
    }

    fn map_rows(
        &self,
        batch_size: Vec<usize>,
        f: impl Fn(&Field) -> Result<Field>,
    ) -> Result<TensorDict> {
        let fields = self
            .fields
            .iter()
            .map(|(k, field)| Ok((k.clone(), f(field)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(TensorDict { fields, batch_size })
    }

    /// Copy of the row at `ix` of the leading batch axis
    pub fn index(&self, ix: usize) -> Result<TensorDict> {
        self.require_batch_axis()?;
        if ix >= self.len() {
            return Err(Error::IndexOutOfBounds {
                index: ix,
                len: self.len(),
            });
        }
        self.map_rows(self.batch_size[1..].to_vec(), |f| f.row(ix))
    }

    /// Copy of the rows at `ixs`, in that order
    pub fn select_rows(&self, ixs: &[usize]) -> Result<TensorDict> {
        self.require_batch_axis()?;
        if let Some(&ix) = ixs.iter().find(|&&ix| ix >= self.len()) {
            return Err(Error::IndexOutOfBounds {
                index: ix,
                len: self.len(),
            });
        }
        let mut batch_size = self.batch_size.clone();
        batch_size[0] = ixs.len();
        self.map_rows(batch_size, |f| f.select_rows(ixs))
    }

    /// Copy of a contiguous range of rows
    pub fn slice(&self, range: Range<usize>) -> Result<TensorDict> {
        self.require_batch_axis()?;
        if range.start > range.end || range.end > self.len() {
            return Err(Error::IndexOutOfBounds {
                index: range.end,
                len: self.len(),
            });
        }
        let mut batch_size = self.batch_size.clone();
        batch_size[0] = range.len();
        self.map_rows(batch_size, |f| f.slice_rows(range.clone()))
    }

    /// Copy holding only the named fields
    pub fn select(&self, keys: &[&str]) -> Result<TensorDict> {
        let mut td = TensorDict::new(self.batch_size.clone());
        for &key in keys {
            td.fields.insert(key.to_string(), self.try_get(key)?.clone());
        }
        Ok(td)
    }

    /// Copy without the named fields; absent names are ignored
    pub fn exclude(&self, keys: &[&str]) -> TensorDict {
        let fields = self
            .fields
            .iter()
            .filter(|(k, _)| !keys.contains(&k.as_str()))
            .map(|(k, f)| (k.clone(), f.clone()))
            .collect();
        TensorDict {
            fields,
            batch_size: self.batch_size.clone(),
        }
    }

    fn check_same_keys(tds: &[TensorDict]) -> Result<&TensorDict> {
        let first = tds
            .first()
            .ok_or_else(|| Error::Shape(String::from("cannot join zero records")))?;
        for td in &tds[1..] {
            if !td.keys().eq(first.keys()) {
                return Err(Error::Shape(format!(
                    "records disagree on fields: {:?} vs {:?}",
                    first.keys().collect::<Vec<_>>(),
                    td.keys().collect::<Vec<_>>()
                )));
            }
        }
        Ok(first)
    }

    /// Stack records of identical batch shape along a new leading axis
    pub fn stack(tds: &[TensorDict]) -> Result<TensorDict> {
        let first = Self::check_same_keys(tds)?;
        if let Some(td) = tds.iter().find(|td| td.batch_size != first.batch_size) {
            return Err(Error::Shape(format!(
                "cannot stack batch shapes {:?} and {:?}",
                first.batch_size, td.batch_size
            )));
        }

        let mut batch_size = vec![tds.len()];
        batch_size.extend_from_slice(&first.batch_size);
        let mut out = TensorDict::new(batch_size);
        for key in first.fields.keys() {
            let parts = tds.iter().map(|td| &td.fields[key]).collect::<Vec<_>>();
            out.fields.insert(key.clone(), Field::stack(&parts)?);
        }
        Ok(out)
    }

    /// Concatenate records along their existing leading batch axis
    pub fn cat(tds: &[TensorDict]) -> Result<TensorDict> {
        let first = Self::check_same_keys(tds)?;
        for td in tds {
            td.require_batch_axis()?;
            if td.batch_size[1..] != first.batch_size[1..] {
                return Err(Error::Shape(format!(
                    "cannot concatenate batch shapes {:?} and {:?}",
                    first.batch_size, td.batch_size
                )));
            }
        }

        let mut batch_size = first.batch_size.clone();
        batch_size[0] = tds.iter().map(TensorDict::len).sum();
        let mut out = TensorDict::new(batch_size);
        for key in first.fields.keys() {
            let parts = tds.iter().map(|td| &td.fields[key]).collect::<Vec<_>>();
            out.fields.insert(key.clone(), Field::concat(&parts)?);
        }
        Ok(out)
    }

    /// Same batch shape, same field names, and every field close within tolerance
    pub fn allclose(&self, other: &TensorDict, rtol: f32, atol: f32) -> bool {
        self.batch_size == other.batch_size
            && self.keys().eq(other.keys())
            && self
                .fields
                .iter()
                .all(|(k, f)| f.allclose(&other.fields[k], rtol, atol))
    }
}

fn check_prefix(key: &str, field: &Field, batch_size: &[usize]) -> Result<()> {
    if field.shape().starts_with(batch_size) {
        Ok(())
    } else {
        Err(Error::Shape(format!(
            "field `{key}` of shape {:?} does not match batch size {:?}",
            field.shape(),
            batch_size
        )))
    }
}
