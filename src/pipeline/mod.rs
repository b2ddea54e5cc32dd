//! Model pipeline lifecycle shared by every model-backed operation.
//!
//! A pipeline splits a request into three stages that implementors provide:
//!
//! - `encode` validates the raw request and turns it into model-ready tensors. Domain errors
//!   raised here abort the call before anything touches the compute device.
//! - `forward` runs the model on tensors that already live on the pipeline's device.
//! - `decode` turns host-side model output back into text.
//!
//! [`invoke`] strings the stages together and owns the device transfers in between, so
//! implementors never move tensors themselves. Models and tokenizers are acquired lazily through
//! [`ModelSlots`], which guarantees a single load per pipeline instance even under concurrent
//! first use.

mod device;
mod slots;
mod types;

pub use device::{device_label, select_device};
pub use slots::{ModelLoader, ModelSlots};
pub use types::PipelineError;

use candle_core::{Device, Tensor};
use std::time::Instant;

/// Values that can be copied onto a compute device.
pub trait ToDevice: Sized {
    /// Return a copy of `self` whose tensors live on `device`.
    fn to_device(&self, device: &Device) -> candle_core::Result<Self>;
}

impl ToDevice for Tensor {
    fn to_device(&self, device: &Device) -> candle_core::Result<Self> {
        Tensor::to_device(self, device)
    }
}

/// Capability interface implemented by every model-backed operation.
pub trait ModelPipeline {
    /// Raw request accepted by [`ModelPipeline::encode`].
    type Request<'a>;
    /// Model-ready input produced by `encode`.
    type Encoded: ToDevice;
    /// Raw model output produced by `forward`.
    type Output: ToDevice;
    /// Error type surfaced to callers; lifecycle failures convert into it.
    type Error: From<PipelineError>;

    /// Check, pre-process, and tokenize the request.
    fn encode(&self, request: Self::Request<'_>) -> Result<Self::Encoded, Self::Error>;

    /// Run the model on encoded input that already lives on [`ModelPipeline::device`].
    fn forward(&self, encoded: Self::Encoded) -> Result<Self::Output, Self::Error>;

    /// Decode host-side model output into user-facing text.
    fn decode(&self, output: Self::Output) -> Result<String, Self::Error>;

    /// Device the pipeline's model is placed on.
    fn device(&self) -> &Device;

    /// Name used in logs for this pipeline's model.
    fn model_name(&self) -> &str;
}

/// Run the encode → to-device → forward → to-host → decode contract for one request.
pub fn invoke<P>(pipeline: &P, request: P::Request<'_>) -> Result<String, P::Error>
where
    P: ModelPipeline + ?Sized,
{
    let started = Instant::now();
    let encoded = pipeline.encode(request)?;
    let encoded = encoded
        .to_device(pipeline.device())
        .map_err(PipelineError::Transfer)?;

    let output = pipeline.forward(encoded)?;
    let output = output
        .to_device(&Device::Cpu)
        .map_err(PipelineError::Transfer)?;

    let decoded = pipeline.decode(output)?;
    tracing::debug!(
        model = pipeline.model_name(),
        device = device_label(pipeline.device()),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Pipeline invocation completed"
    );
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug)]
    enum EchoError {
        Rejected,
        Pipeline(PipelineError),
    }

    impl From<PipelineError> for EchoError {
        fn from(error: PipelineError) -> Self {
            Self::Pipeline(error)
        }
    }

    /// Pipeline that doubles a list of numbers and records which stages ran.
    struct EchoPipeline {
        device: Device,
        stages: Mutex<Vec<&'static str>>,
    }

    impl EchoPipeline {
        fn new() -> Self {
            Self {
                device: Device::Cpu,
                stages: Mutex::new(Vec::new()),
            }
        }

        fn stages(&self) -> Vec<&'static str> {
            self.stages.lock().expect("stages lock").clone()
        }
    }

    impl ModelPipeline for EchoPipeline {
        type Request<'a> = &'a [u32];
        type Encoded = Tensor;
        type Output = Tensor;
        type Error = EchoError;

        fn encode(&self, request: &[u32]) -> Result<Tensor, EchoError> {
            self.stages.lock().expect("stages lock").push("encode");
            if request.is_empty() {
                return Err(EchoError::Rejected);
            }
            Tensor::new(request, &Device::Cpu)
                .map_err(|error| EchoError::Pipeline(PipelineError::Tensor(error)))
        }

        fn forward(&self, encoded: Tensor) -> Result<Tensor, EchoError> {
            self.stages.lock().expect("stages lock").push("forward");
            if encoded.dim(0).map_err(PipelineError::Tensor)? > 3 {
                return Err(PipelineError::MissingToken("</s>".to_string()).into());
            }
            encoded
                .affine(2.0, 0.0)
                .map_err(|error| EchoError::Pipeline(PipelineError::Generation(error)))
        }

        fn decode(&self, output: Tensor) -> Result<String, EchoError> {
            self.stages.lock().expect("stages lock").push("decode");
            let values = output
                .to_vec1::<u32>()
                .map_err(|error| EchoError::Pipeline(PipelineError::Tensor(error)))?;
            Ok(values
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(","))
        }

        fn device(&self) -> &Device {
            &self.device
        }

        fn model_name(&self) -> &str {
            "echo"
        }
    }

    #[test]
    fn invoke_runs_all_stages_in_order() {
        let pipeline = EchoPipeline::new();
        let output = invoke(&pipeline, &[1, 2, 3]).expect("invocation succeeded");
        assert_eq!(output, "2,4,6");
        assert_eq!(pipeline.stages(), vec!["encode", "forward", "decode"]);
    }

    #[test]
    fn encode_errors_skip_forward_and_decode() {
        let pipeline = EchoPipeline::new();
        let error = invoke(&pipeline, &[]).expect_err("empty request rejected");
        assert!(matches!(error, EchoError::Rejected));
        assert_eq!(pipeline.stages(), vec!["encode"]);
    }

    #[test]
    fn forward_errors_surface_through_the_pipeline_error() {
        let pipeline = EchoPipeline::new();
        let error = invoke(&pipeline, &[1, 2, 3, 4]).expect_err("forward fails");
        let EchoError::Pipeline(PipelineError::MissingToken(token)) = &error else {
            panic!("expected a missing-token failure, got {error:?}");
        };
        assert_eq!(token, "</s>");
        assert_eq!(pipeline.stages(), vec!["encode", "forward"]);
    }
}
