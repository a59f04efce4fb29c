//! Helpers for feeding and reading ONNX sessions.
//!
//! Exports disagree on the integer types of token ids and timesteps, so
//! integer inputs are built in whatever element type the graph declares.

use ndarray::{Array, Dimension, IxDyn};
use ort::session::Session;
use ort::tensor::TensorElementType;
use ort::value::{DynValue, Tensor, ValueType};

use crate::error::{Error, Result};

pub(crate) fn inference_err(source: ort::Error) -> Error {
    Error::Inference { source }
}

/// Element type the session declares for input `name`, if it is a tensor input.
pub(crate) fn input_element_type(session: &Session, name: &str) -> Option<TensorElementType> {
    session
        .inputs
        .iter()
        .find(|input| input.name == name)
        .and_then(|input| match &input.input_type {
            ValueType::Tensor { ty, .. } => Some(*ty),
            _ => None,
        })
}

/// Whether the session has an input called `name`.
pub(crate) fn has_input(session: &Session, name: &str) -> bool {
    session.inputs.iter().any(|input| input.name == name)
}

/// Build an integer-valued input as `int64`, `int32` or `float32`, following the graph.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub(crate) fn integer_input<D: Dimension + 'static>(
    session: &Session,
    name: &str,
    values: Array<i64, D>,
) -> Result<DynValue> {
    let value = match input_element_type(session, name) {
        Some(TensorElementType::Int32) => {
            Tensor::from_array(values.mapv(|v| v as i32)).map(Tensor::into_dyn)
        }
        Some(TensorElementType::Float32) => {
            Tensor::from_array(values.mapv(|v| v as f32)).map(Tensor::into_dyn)
        }
        _ => Tensor::from_array(values).map(Tensor::into_dyn),
    };
    value.map_err(inference_err)
}

/// Build a `float32` input from an owned array.
pub(crate) fn float_input<D: Dimension + 'static>(values: Array<f32, D>) -> Result<DynValue> {
    Tensor::from_array(values)
        .map(Tensor::into_dyn)
        .map_err(inference_err)
}

/// Copy an `f32` output into an owned array of dimensionality `D`.
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
pub(crate) fn extract<D: Dimension>(
    value: &ort::value::ValueRef<'_>,
    what: &str,
) -> Result<Array<f32, D>> {
    let (shape_info, data) = value.try_extract_tensor::<f32>().map_err(inference_err)?;

    // Safe: tensor dimensions are always non-negative and within bounds
    let dims: Vec<usize> = shape_info.iter().map(|&x| x as usize).collect();

    let array = Array::from_shape_vec(IxDyn(&dims), data.to_vec()).map_err(|_| {
        Error::ShapeMismatch {
            expected: format!("{what} with shape {dims:?}"),
            actual: format!("{} elements", data.len()),
        }
    })?;

    let rank = dims.len();
    array
        .into_dimensionality::<D>()
        .map_err(|_| Error::ShapeMismatch {
            expected: format!("{what} of rank {}", D::NDIM.unwrap_or(rank)),
            actual: format!("{rank}D tensor"),
        })
}

/// Error for a session that produced no outputs.
pub(crate) fn missing_output(what: &str) -> Error {
    Error::ShapeMismatch {
        expected: format!("{what} output"),
        actual: "no output".to_string(),
    }
}
