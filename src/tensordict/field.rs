use std::ops::Range;

use ndarray::{Array, ArrayD, ArrayViewD, Axis, Dimension, IxDyn, Slice};

use crate::error::{Error, Result};

/// Element type of a [`Field`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Float,
    Int,
    Bool,
}

/// A dynamically shaped array stored under a name in a [`TensorDict`](super::TensorDict)
///
/// The leading axes of a field are the batch axes of the record that owns it.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Float(ArrayD<f32>),
    Int(ArrayD<i64>),
    Bool(ArrayD<bool>),
}

macro_rules! map_array {
    ($field:expr, $arr:ident => $body:expr) => {
        match $field {
            Field::Float($arr) => Field::Float($body),
            Field::Int($arr) => Field::Int($body),
            Field::Bool($arr) => Field::Bool($body),
        }
    };
}

macro_rules! with_array {
    ($field:expr, $arr:ident => $body:expr) => {
        match $field {
            Field::Float($arr) => $body,
            Field::Int($arr) => $body,
            Field::Bool($arr) => $body,
        }
    };
}

#[derive(Clone, Copy)]
enum Join {
    Stack,
    Concat,
}

impl Field {
    /// Build a float field from row-major values
    pub fn float(shape: &[usize], values: Vec<f32>) -> Result<Self> {
        Ok(Field::Float(ArrayD::from_shape_vec(IxDyn(shape), values)?))
    }

    /// Build an integer field from row-major values
    pub fn int(shape: &[usize], values: Vec<i64>) -> Result<Self> {
        Ok(Field::Int(ArrayD::from_shape_vec(IxDyn(shape), values)?))
    }

    /// Build a boolean field from row-major values
    pub fn bool(shape: &[usize], values: Vec<bool>) -> Result<Self> {
        Ok(Field::Bool(ArrayD::from_shape_vec(IxDyn(shape), values)?))
    }

    /// A float field of zeros
    pub fn zeros(shape: &[usize]) -> Self {
        Field::Float(ArrayD::zeros(IxDyn(shape)))
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            Field::Float(_) => FieldKind::Float,
            Field::Int(_) => FieldKind::Int,
            Field::Bool(_) => FieldKind::Bool,
        }
    }

    pub fn shape(&self) -> &[usize] {
        with_array!(self, a => a.shape())
    }

    /// Size of the leading axis, 0 for a scalar field
    pub fn len(&self) -> usize {
        self.shape().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of elements
    pub fn numel(&self) -> usize {
        with_array!(self, a => a.len())
    }

    pub fn as_float(&self) -> Option<&ArrayD<f32>> {
        match self {
            Field::Float(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_float_mut(&mut self) -> Option<&mut ArrayD<f32>> {
        match self {
            Field::Float(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<&ArrayD<i64>> {
        match self {
            Field::Int(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<&ArrayD<bool>> {
        match self {
            Field::Bool(a) => Some(a),
            _ => None,
        }
    }

    fn check_row(&self, ix: usize) -> Result<()> {
        if self.shape().is_empty() {
            return Err(Error::Shape(String::from("cannot index rows of a scalar field")));
        }
        if ix >= self.len() {
            return Err(Error::IndexOutOfBounds {
                index: ix,
                len: self.len(),
            });
        }
        Ok(())
    }

    /// Copy of the row at `ix` along the leading axis
    pub fn row(&self, ix: usize) -> Result<Self> {
        self.check_row(ix)?;
        Ok(map_array!(self, a => a.index_axis(Axis(0), ix).to_owned()))
    }

    /// Copy of the rows at `ixs` along the leading axis, in that order
    pub fn select_rows(&self, ixs: &[usize]) -> Result<Self> {
        for &ix in ixs {
            self.check_row(ix)?;
        }
        Ok(map_array!(self, a => a.select(Axis(0), ixs)))
    }

    /// Copy of a contiguous range of rows
    pub fn slice_rows(&self, range: Range<usize>) -> Result<Self> {
        if range.start > range.end || range.end > self.len() {
            return Err(Error::IndexOutOfBounds {
                index: range.end,
                len: self.len(),
            });
        }
        Ok(map_array!(self, a => a.slice_axis(Axis(0), Slice::from(range)).to_owned()))
    }

    /// Overwrite rows `rows` in place with the leading rows of `src`
    pub fn assign_rows(&mut self, rows: &[usize], src: &Field) -> Result<()> {
        if self.kind() != src.kind() {
            return Err(Error::Shape(format!(
                "cannot assign {:?} values into a {:?} field",
                src.kind(),
                self.kind()
            )));
        }
        let mut expected = vec![rows.len()];
        expected.extend_from_slice(self.shape().get(1..).unwrap_or_default());
        if src.shape() != expected.as_slice() {
            return Err(Error::Shape(format!(
                "expected values of shape {:?}, got {:?}",
                expected,
                src.shape()
            )));
        }
        for &row in rows {
            self.check_row(row)?;
        }

        match (self, src) {
            (Field::Float(dst), Field::Float(src)) => assign(dst, rows, src),
            (Field::Int(dst), Field::Int(src)) => assign(dst, rows, src),
            (Field::Bool(dst), Field::Bool(src)) => assign(dst, rows, src),
            _ => unreachable!("kinds checked above"),
        }
        Ok(())
    }

    /// Stack fields of identical shape along a new leading axis
    pub fn stack(fields: &[&Field]) -> Result<Self> {
        Self::join(fields, Join::Stack)
    }

    /// Concatenate fields along their existing leading axis
    pub fn concat(fields: &[&Field]) -> Result<Self> {
        if fields.iter().any(|f| f.shape().is_empty()) {
            return Err(Error::Shape(String::from("cannot concatenate scalar fields")));
        }
        Self::join(fields, Join::Concat)
    }

    fn join(fields: &[&Field], how: Join) -> Result<Self> {
        let first = fields
            .first()
            .ok_or_else(|| Error::Shape(String::from("cannot join zero fields")))?;
        let joined = match first.kind() {
            FieldKind::Float => Field::Float(join(&views(fields, Field::as_float)?, how)?),
            FieldKind::Int => Field::Int(join(&views(fields, Field::as_int)?, how)?),
            FieldKind::Bool => Field::Bool(join(&views(fields, Field::as_bool)?, how)?),
        };
        Ok(joined)
    }

    /// Largest absolute value within each row of the leading axis
    ///
    /// Only numeric fields qualify; used to reduce priority signals to one scalar per row.
    pub fn abs_max_rows(&self) -> Result<Vec<f32>> {
        if self.shape().is_empty() {
            return Err(Error::Shape(String::from("expected at least one batch axis")));
        }
        // NaN propagates
        let fold = |acc: f32, v: f32| {
            if acc.is_nan() || v.is_nan() {
                f32::NAN
            } else {
                acc.max(v.abs())
            }
        };
        match self {
            Field::Float(a) => Ok(a
                .axis_iter(Axis(0))
                .map(|row| row.iter().fold(0.0, |acc, &v| fold(acc, v)))
                .collect()),
            Field::Int(a) => Ok(a
                .axis_iter(Axis(0))
                .map(|row| row.iter().fold(0.0, |acc, &v| fold(acc, v as f32)))
                .collect()),
            Field::Bool(_) => Err(Error::Shape(String::from(
                "boolean fields carry no numeric signal",
            ))),
        }
    }

    /// Elementwise comparison, floats within `atol + rtol * |other|`, other kinds exactly
    pub fn allclose(&self, other: &Field, rtol: f32, atol: f32) -> bool {
        match (self, other) {
            (Field::Float(a), Field::Float(b)) => {
                a.shape() == b.shape()
                    && a.iter()
                        .zip(b.iter())
                        .all(|(x, y)| (x - y).abs() <= atol + rtol * y.abs())
            }
            _ => self == other,
        }
    }
}

fn assign<A: Clone>(dst: &mut ArrayD<A>, rows: &[usize], src: &ArrayD<A>) {
    for (j, &row) in rows.iter().enumerate() {
        dst.index_axis_mut(Axis(0), row)
            .assign(&src.index_axis(Axis(0), j));
    }
}

fn views<'a, A: 'a>(
    fields: &[&'a Field],
    pick: fn(&'a Field) -> Option<&'a ArrayD<A>>,
) -> Result<Vec<ArrayViewD<'a, A>>> {
    fields
        .iter()
        .map(|&f| {
            pick(f).map(|a| a.view()).ok_or_else(|| {
                Error::Shape(format!(
                    "cannot join {:?} fields with {:?} fields",
                    fields[0].kind(),
                    f.kind()
                ))
            })
        })
        .collect()
}

fn join<A: Clone>(views: &[ArrayViewD<'_, A>], how: Join) -> Result<ArrayD<A>> {
    let joined = match how {
        Join::Stack => ndarray::stack(Axis(0), views)?,
        Join::Concat => ndarray::concatenate(Axis(0), views)?,
    };
    Ok(joined)
}

impl<D: Dimension> From<Array<f32, D>> for Field {
    fn from(a: Array<f32, D>) -> Self {
        Field::Float(a.into_dyn())
    }
}

impl<D: Dimension> From<Array<i64, D>> for Field {
    fn from(a: Array<i64, D>) -> Self {
        Field::Int(a.into_dyn())
    }
}

impl<D: Dimension> From<Array<bool, D>> for Field {
    fn from(a: Array<bool, D>) -> Self {
        Field::Bool(a.into_dyn())
    }
}
