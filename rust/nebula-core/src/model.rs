//! Model update representation.
//!
//! A [`ModelUpdate`] is an ordered mapping from parameter names to dense [`Tensor`]s. The
//! aggregation strategies treat it as a point in a vector space: all parameters are flattened in
//! name order into one contiguous vector, combined, and rebuilt with the original [`Schema`].

use std::collections::{btree_map, BTreeMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
#[error("tensor of shape {shape:?} expects {expected} values, got {actual}")]
/// Errors related to building a tensor from a shape and its values.
pub struct TensorShapeError {
    shape: Vec<usize>,
    expected: usize,
    actual: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A dense, row-major tensor of parameters.
pub struct Tensor {
    shape: Vec<usize>,
    values: Vec<f32>,
}

impl Tensor {
    /// Creates a tensor from its shape and row-major values.
    ///
    /// # Errors
    /// Fails if the number of values doesn't match the product of the shape dimensions.
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Result<Self, TensorShapeError> {
        let expected = shape.iter().product::<usize>();
        if expected != values.len() {
            return Err(TensorShapeError {
                shape,
                expected,
                actual: values.len(),
            });
        }
        Ok(Self { shape, values })
    }

    /// Creates a tensor holding a single value.
    pub fn scalar(value: f32) -> Self {
        Self {
            shape: vec![1],
            values: vec![value],
        }
    }

    /// Creates a one dimensional tensor.
    pub fn vector(values: Vec<f32>) -> Self {
        Self {
            shape: vec![values.len()],
            values,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Gets the number of scalar values of this tensor.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// The parameter names and shapes of a model update, in name order.
pub struct Schema(Vec<(String, Vec<usize>)>);

impl Schema {
    /// Gets the total number of scalar parameters described by this schema.
    pub fn num_params(&self) -> usize {
        self.0
            .iter()
            .map(|(_, shape)| shape.iter().product::<usize>())
            .sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[usize])> {
        self.0
            .iter()
            .map(|(name, shape)| (name.as_str(), shape.as_slice()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// The trained parameters produced by one node in one round.
pub struct ModelUpdate(BTreeMap<String, Tensor>);

impl ModelUpdate {
    /// Creates an update without any parameters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a named parameter tensor, replacing any previous tensor of the same name.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.0.insert(name.into(), tensor)
    }

    /// Adds a named parameter tensor.
    pub fn with(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.insert(name, tensor);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.0.get(name)
    }

    /// Gets the number of named parameters.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the named parameters in name order.
    pub fn iter(&self) -> btree_map::Iter<String, Tensor> {
        self.0.iter()
    }

    /// Gets the schema of this update.
    pub fn schema(&self) -> Schema {
        Schema(
            self.0
                .iter()
                .map(|(name, tensor)| (name.clone(), tensor.shape.clone()))
                .collect(),
        )
    }

    /// Flattens all parameters into one vector, in name order.
    pub fn flatten(&self) -> Vec<f32> {
        let mut flat = Vec::with_capacity(self.0.values().map(Tensor::len).sum());
        for tensor in self.0.values() {
            flat.extend_from_slice(&tensor.values);
        }
        flat
    }

    /// Rebuilds an update from a flat vector laid out according to `schema`.
    ///
    /// The caller guarantees that `flat` holds exactly [`Schema::num_params`] values.
    pub(crate) fn from_flat(schema: &Schema, flat: &[f32]) -> Self {
        let mut offset = 0;
        let params = schema
            .0
            .iter()
            .map(|(name, shape)| {
                let len = shape.iter().product::<usize>();
                let values = flat[offset..offset + len].to_vec();
                offset += len;
                (
                    name.clone(),
                    Tensor {
                        shape: shape.clone(),
                        values,
                    },
                )
            })
            .collect();
        Self(params)
    }
}

impl std::iter::FromIterator<(String, Tensor)> for ModelUpdate {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_shape() {
        assert!(Tensor::new(vec![2, 3], vec![0.; 6]).is_ok());
        assert_eq!(
            Tensor::new(vec![2, 3], vec![0.; 5]).unwrap_err(),
            TensorShapeError {
                shape: vec![2, 3],
                expected: 6,
                actual: 5,
            }
        );
    }

    #[test]
    fn test_flatten_in_name_order() {
        let update = ModelUpdate::new()
            .with("w2", Tensor::vector(vec![3., 4.]))
            .with("b", Tensor::scalar(0.5))
            .with("w1", Tensor::new(vec![2, 1], vec![1., 2.]).unwrap());
        assert_eq!(update.flatten(), vec![0.5, 1., 2., 3., 4.]);
        assert_eq!(update.schema().num_params(), 5);

        let rebuilt = ModelUpdate::from_flat(&update.schema(), &update.flatten());
        assert_eq!(rebuilt, update);
    }
}
