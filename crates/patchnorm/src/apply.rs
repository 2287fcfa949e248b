//! Affine and conditioning scale/shift applied after normalization.

use candle_core::{DType, Device, Tensor};
use patchnorm_common::{NormError, Result};

use crate::moments::dims4;

/// Learned per-channel `weight` and `bias`, both `[C]`.
#[derive(Debug, Clone)]
pub struct AffineParams {
    weight: Tensor,
    bias: Tensor,
}

impl AffineParams {
    pub fn new(weight: Tensor, bias: Tensor) -> Result<Self> {
        let channels = match *weight.dims() {
            [c] => c,
            _ => return Err(NormError::shape_mismatch("affine weight", "[C]", weight.dims())),
        };
        if bias.dims() != [channels] {
            return Err(NormError::shape_mismatch(
                "affine bias",
                format!("[{channels}]"),
                bias.dims(),
            ));
        }
        Ok(Self { weight, bias })
    }

    /// `weight = 1`, `bias = 0`.
    pub fn identity(num_channels: usize, device: &Device) -> Result<Self> {
        Self::new(
            Tensor::ones(num_channels, DType::F32, device)?,
            Tensor::zeros(num_channels, DType::F32, device)?,
        )
    }

    pub fn num_channels(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    /// `x * weight + bias`, broadcast over `[1, C, 1, 1]`.
    pub fn apply(&self, xs: &Tensor) -> Result<Tensor> {
        let (_, c, _, _) = dims4("affine", xs)?;
        if c != self.num_channels() {
            return Err(NormError::shape_mismatch(
                "affine",
                format!("[B, {}, H, W]", self.num_channels()),
                xs.dims(),
            ));
        }
        let weight = self.weight.to_dtype(xs.dtype())?.reshape((1, c, 1, 1))?;
        let bias = self.bias.to_dtype(xs.dtype())?.reshape((1, c, 1, 1))?;
        Ok(xs.broadcast_mul(&weight)?.broadcast_add(&bias)?)
    }
}

/// Per-sample conditioning, both `[B, C]`.
#[derive(Debug, Clone)]
pub struct ScaleShift {
    scale: Tensor,
    shift: Tensor,
}

impl ScaleShift {
    pub fn new(scale: Tensor, shift: Tensor) -> Result<Self> {
        if scale.rank() != 2 {
            return Err(NormError::shape_mismatch("scale", "[B, C]", scale.dims()));
        }
        if shift.dims() != scale.dims() {
            return Err(NormError::shape_mismatch(
                "shift",
                format!("{:?}", scale.dims()),
                shift.dims(),
            ));
        }
        Ok(Self { scale, shift })
    }

    pub fn scale(&self) -> &Tensor {
        &self.scale
    }

    pub fn shift(&self) -> &Tensor {
        &self.shift
    }

    /// `x * (1 + scale) + shift`, broadcast over `[B, C, 1, 1]`.
    pub fn apply(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, c, _, _) = dims4("scale_shift", xs)?;
        if self.scale.dims() != [b, c] {
            return Err(NormError::shape_mismatch(
                "scale_shift",
                format!("[{}, {}, H, W]", self.scale.dims()[0], self.scale.dims()[1]),
                xs.dims(),
            ));
        }
        let scale = self.scale.to_dtype(xs.dtype())?.affine(1.0, 1.0)?.reshape((b, c, 1, 1))?;
        let shift = self.shift.to_dtype(xs.dtype())?.reshape((b, c, 1, 1))?;
        Ok(xs.broadcast_mul(&scale)?.broadcast_add(&shift)?)
    }
}
