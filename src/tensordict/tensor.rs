use burn::tensor::{backend::Backend, BasicOps, Bool, Data, Float, Int, Shape, Tensor};
use ndarray::{ArrayD, IxDyn};

use super::{Field, TensorDict};
use crate::error::{Error, Result};

/// A trait for placing record fields on a device as tensors of dimension `D`
///
/// Implemented for [`Field`] for each tensor kind; the field's element kind and rank must match.
pub trait ToTensor<B: Backend, const D: usize, K: BasicOps<B>> {
    fn to_tensor(&self, device: &B::Device) -> Result<Tensor<B, D, K>>;
}

fn dims<const D: usize>(shape: &[usize]) -> Result<[usize; D]> {
    <[usize; D]>::try_from(shape).map_err(|_| {
        Error::Shape(format!(
            "cannot view a {}-d field as a {D}-d tensor",
            shape.len()
        ))
    })
}

fn kind_error(field: &Field, wanted: &str) -> Error {
    Error::Shape(format!(
        "expected a {wanted} field, found {:?}",
        field.kind()
    ))
}

impl<B: Backend, const D: usize> ToTensor<B, D, Float> for Field {
    fn to_tensor(&self, device: &B::Device) -> Result<Tensor<B, D>> {
        let a = self.as_float().ok_or_else(|| kind_error(self, "float"))?;
        let data = Data::new(
            a.iter().copied().collect::<Vec<_>>(),
            Shape::new(dims(a.shape())?),
        );
        Ok(Tensor::from_data(data.convert::<B::FloatElem>(), device))
    }
}

impl<B: Backend, const D: usize> ToTensor<B, D, Int> for Field {
    fn to_tensor(&self, device: &B::Device) -> Result<Tensor<B, D, Int>> {
        let a = self.as_int().ok_or_else(|| kind_error(self, "int"))?;
        let data = Data::new(
            a.iter().copied().collect::<Vec<_>>(),
            Shape::new(dims(a.shape())?),
        );
        Ok(Tensor::from_data(data.convert::<B::IntElem>(), device))
    }
}

impl<B: Backend, const D: usize> ToTensor<B, D, Bool> for Field {
    fn to_tensor(&self, device: &B::Device) -> Result<Tensor<B, D, Bool>> {
        let a = self.as_bool().ok_or_else(|| kind_error(self, "bool"))?;
        let data = Data::new(
            a.iter().copied().collect::<Vec<_>>(),
            Shape::new(dims(a.shape())?),
        );
        Ok(Tensor::from_bool(data, device))
    }
}

impl Field {
    /// Copy a float tensor back to host memory
    pub fn from_tensor<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Self> {
        let data = tensor.into_data().convert::<f32>();
        Ok(Field::Float(ArrayD::from_shape_vec(
            IxDyn(&data.shape.dims),
            data.value,
        )?))
    }

    /// Copy an integer tensor back to host memory
    pub fn from_int_tensor<B: Backend, const D: usize>(
        tensor: Tensor<B, D, Int>,
    ) -> Result<Self> {
        let data = tensor.into_data().convert::<i64>();
        Ok(Field::Int(ArrayD::from_shape_vec(
            IxDyn(&data.shape.dims),
            data.value,
        )?))
    }
}

impl TensorDict {
    /// Place a float field on `device`
    pub fn to_tensor<B: Backend, const D: usize>(
        &self,
        key: &str,
        device: &B::Device,
    ) -> Result<Tensor<B, D>> {
        <Field as ToTensor<B, D, Float>>::to_tensor(self.try_get(key)?, device)
    }

    /// Place an integer field on `device`
    pub fn to_int_tensor<B: Backend, const D: usize>(
        &self,
        key: &str,
        device: &B::Device,
    ) -> Result<Tensor<B, D, Int>> {
        <Field as ToTensor<B, D, Int>>::to_tensor(self.try_get(key)?, device)
    }

    /// Place a boolean field on `device`
    pub fn to_bool_tensor<B: Backend, const D: usize>(
        &self,
        key: &str,
        device: &B::Device,
    ) -> Result<Tensor<B, D, Bool>> {
        <Field as ToTensor<B, D, Bool>>::to_tensor(self.try_get(key)?, device)
    }

    /// Store a float tensor under `key`, copying it to host memory
    pub fn set_tensor<B: Backend, const D: usize>(
        &mut self,
        key: impl Into<String>,
        tensor: Tensor<B, D>,
    ) -> Result<()> {
        self.set(key, Field::from_tensor(tensor)?)
    }

    /// Store an integer tensor under `key`, copying it to host memory
    pub fn set_int_tensor<B: Backend, const D: usize>(
        &mut self,
        key: impl Into<String>,
        tensor: Tensor<B, D, Int>,
    ) -> Result<()> {
        self.set(key, Field::from_int_tensor(tensor)?)
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;
    use ndarray::{arr1, arr2};

    use super::*;

    type TestBackend = NdArray;

    fn record() -> TensorDict {
        TensorDict::new([2])
            .with("obs", arr2(&[[0.5f32, 1.0, 1.5], [2.0, 2.5, 3.0]]))
            .unwrap()
            .with("action", arr1(&[1i64, 2]))
            .unwrap()
            .with("mask", arr2(&[[true, false], [false, true]]))
            .unwrap()
    }

    #[test]
    fn float_field_roundtrip() {
        let device = Default::default();
        let td = record();
        let obs = td.to_tensor::<TestBackend, 2>("obs", &device).unwrap();
        assert_eq!(obs.dims(), [2, 3]);

        let mut copy = td.clone();
        copy.set_tensor("obs", obs * 2.0).unwrap();
        assert_eq!(
            copy.get("obs"),
            Some(&Field::from(arr2(&[[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]])))
        );
    }

    #[test]
    fn int_and_bool_fields() {
        let device = Default::default();
        let td = record();
        let action = td.to_int_tensor::<TestBackend, 1>("action", &device).unwrap();
        assert_eq!(action.dims(), [2]);

        let mut copy = td.clone();
        copy.set_int_tensor("action", action + 1).unwrap();
        assert_eq!(copy.get("action"), Some(&Field::from(arr1(&[2i64, 3]))));

        let mask = td.to_bool_tensor::<TestBackend, 2>("mask", &device).unwrap();
        assert_eq!(mask.into_data().value, vec![true, false, false, true]);
    }

    #[test]
    fn rank_and_kind_are_checked() {
        let device = Default::default();
        let td = record();
        assert!(matches!(
            td.to_tensor::<TestBackend, 3>("obs", &device),
            Err(Error::Shape(_))
        ));
        assert!(matches!(
            td.to_tensor::<TestBackend, 1>("action", &device),
            Err(Error::Shape(_))
        ));
        assert!(matches!(
            td.to_tensor::<TestBackend, 2>("missing", &device),
            Err(Error::MissingKey(_))
        ));
    }
}
