//! Conditioning projection: embedding `[B, E]` to per-channel scale and shift.

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};
use patchnorm_common::{NormError, Result};

use crate::activation::EmbeddingActivation;
use crate::apply::ScaleShift;

/// Optional activation followed by `Linear(E, 2 * C)`, split into `(scale, shift)`.
///
/// The projection depends only on the embedding, so every worker of a
/// sharded layer computes the same values locally.
#[derive(Debug, Clone)]
pub struct ConditioningProjector {
    activation: EmbeddingActivation,
    linear: Linear,
    embedding_dim: usize,
    out_dim: usize,
}

impl ConditioningProjector {
    /// Builds the projection with weights under `vb.pp("linear")`.
    pub fn new(
        embedding_dim: usize,
        out_dim: usize,
        act_fn: Option<&str>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let activation = EmbeddingActivation::resolve(act_fn)?;
        let linear = candle_nn::linear(embedding_dim, 2 * out_dim, vb.pp("linear"))?;
        Ok(Self { activation, linear, embedding_dim, out_dim })
    }

    /// Wraps an existing `[2 * out_dim, embedding_dim]` projection.
    pub fn from_linear(linear: Linear, activation: EmbeddingActivation) -> Result<Self> {
        let (rows, embedding_dim) = match *linear.weight().dims() {
            [rows, cols] if rows % 2 == 0 && rows > 0 => (rows, cols),
            _ => {
                return Err(NormError::shape_mismatch(
                    "conditioning projector",
                    "weight [2 * C, E]",
                    linear.weight().dims(),
                ));
            }
        };
        if let Some(bias) = linear.bias() {
            if bias.dims() != [rows] {
                return Err(NormError::shape_mismatch(
                    "conditioning projector",
                    format!("bias [{rows}]"),
                    bias.dims(),
                ));
            }
        }
        Ok(Self { activation, linear, embedding_dim, out_dim: rows / 2 })
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    pub fn activation(&self) -> EmbeddingActivation {
        self.activation
    }

    pub fn linear(&self) -> &Linear {
        &self.linear
    }

    /// Runs in the projection weights' dtype; the returned halves keep it.
    pub fn project(&self, emb: &Tensor) -> Result<ScaleShift> {
        match *emb.dims() {
            [_, e] if e == self.embedding_dim => {}
            _ => {
                return Err(NormError::shape_mismatch(
                    "project",
                    format!("[B, {}]", self.embedding_dim),
                    emb.dims(),
                ));
            }
        }
        let emb = self.activation.apply(&emb.to_dtype(self.linear.weight().dtype())?)?;
        let projected = self.linear.forward(&emb)?;
        let mut halves = projected.chunk(2, 1)?.into_iter();
        match (halves.next(), halves.next()) {
            (Some(scale), Some(shift)) => ScaleShift::new(scale, shift),
            _ => Err(NormError::shape_mismatch(
                "project",
                format!("[B, {}]", 2 * self.out_dim),
                projected.dims(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::NamedActivation;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn fixed_linear() -> Linear {
        // E = 2, C = 1: scale = e0 + e1, shift = e0 - e1 + 1
        let weight = Tensor::new(&[[1f32, 1.0], [1.0, -1.0]], &Device::Cpu).unwrap();
        let bias = Tensor::new(&[0f32, 1.0], &Device::Cpu).unwrap();
        Linear::new(weight, Some(bias))
    }

    #[test]
    fn project_splits_scale_then_shift() {
        let proj = ConditioningProjector::from_linear(fixed_linear(), EmbeddingActivation::Identity)
            .unwrap();
        assert_eq!(proj.out_dim(), 1);
        assert_eq!(proj.embedding_dim(), 2);

        let emb = Tensor::new(&[[2f32, 3.0], [-1.0, 0.5]], &Device::Cpu).unwrap();
        let ss = proj.project(&emb).unwrap();
        assert_eq!(ss.scale().to_vec2::<f32>().unwrap(), vec![vec![5.0], vec![-0.5]]);
        assert_eq!(ss.shift().to_vec2::<f32>().unwrap(), vec![vec![0.0], vec![-0.5]]);
    }

    #[test]
    fn half_precision_weights_accept_f32_embeddings() {
        let linear = fixed_linear();
        let half = Linear::new(
            linear.weight().to_dtype(DType::F16).unwrap(),
            linear.bias().map(|b| b.to_dtype(DType::F16).unwrap()),
        );
        let proj = ConditioningProjector::from_linear(half, EmbeddingActivation::Identity).unwrap();

        let emb = Tensor::new(&[[2f32, 3.0], [-1.0, 0.5]], &Device::Cpu).unwrap();
        let ss = proj.project(&emb).unwrap();
        assert_eq!(ss.scale().dtype(), DType::F16);
        let scale = ss.scale().to_dtype(DType::F32).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(scale, vec![vec![5.0], vec![-0.5]]);
    }

    #[test]
    fn activation_runs_before_the_linear_layer() {
        let proj = ConditioningProjector::from_linear(
            fixed_linear(),
            EmbeddingActivation::Named(NamedActivation::Relu),
        )
        .unwrap();
        let emb = Tensor::new(&[[-1f32, 0.5]], &Device::Cpu).unwrap();
        let ss = proj.project(&emb).unwrap();
        assert_eq!(ss.scale().to_vec2::<f32>().unwrap(), vec![vec![0.5]]);
        assert_eq!(ss.shift().to_vec2::<f32>().unwrap(), vec![vec![0.5]]);
    }

    #[test]
    fn var_builder_layout_uses_linear_prefix() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let proj = ConditioningProjector::new(8, 4, Some("silu"), vb).unwrap();
        assert_eq!(proj.linear().weight().dims(), &[8, 8]);
        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        assert!(names.contains(&"linear.weight".to_string()), "{names:?}");
        assert!(names.contains(&"linear.bias".to_string()), "{names:?}");
    }

    #[test]
    fn wrong_embedding_width_is_rejected() {
        let proj = ConditioningProjector::from_linear(fixed_linear(), EmbeddingActivation::Identity)
            .unwrap();
        let emb = Tensor::zeros((1, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            proj.project(&emb),
            Err(NormError::ShapeMismatch { op: "project", .. })
        ));
    }

    #[test]
    fn odd_output_rows_are_rejected() {
        let weight = Tensor::zeros((3, 2), DType::F32, &Device::Cpu).unwrap();
        let err =
            ConditioningProjector::from_linear(Linear::new(weight, None), EmbeddingActivation::Identity)
                .unwrap_err();
        assert!(matches!(err, NormError::ShapeMismatch { .. }));
    }
}
