//! Dense affine+ReLU layer with accumulating backward pass.
//!
//! The layer owns its weight matrix (row-major `[output][input]`), bias
//! vector, gradient accumulators and the forward scratch for the most recent
//! `forward` call. One layer instance supports a single in-flight
//! forward/backward pair; the batch-parallel path goes through the pure
//! [`DenseLayer::forward_cached`] / [`DenseLayer::backward_into`] variants
//! with task-local [`LayerCache`] / [`GradBuffer`] state instead.

use crate::parallel::parallel_chunks;
use rand::Rng;

/// Output/input unit count above which a layer kernel is bisected onto the
/// rayon pool.
pub const UNIT_PAR_THRESHOLD: usize = 256;
/// Smallest unit span a bisected kernel task will process.
pub const UNIT_PAR_GRAIN: usize = 64;

/// Per-task forward activations for one layer.
#[derive(Debug, Clone, Default)]
pub struct LayerCache {
    pub input: Vec<f32>,
    pub output: Vec<f32>,
}

/// Task-local gradient accumulator with the same shape as one layer.
#[derive(Debug, Clone)]
pub struct GradBuffer {
    pub weights: Vec<f32>,
    pub biases: Vec<f32>,
}

impl GradBuffer {
    pub fn zeroed(input_size: usize, output_size: usize) -> Self {
        Self { weights: vec![0.0; input_size * output_size], biases: vec![0.0; output_size] }
    }

    /// Element-wise addition of another buffer of the same shape.
    pub fn merge_from(&mut self, other: &GradBuffer) {
        debug_assert_eq!(self.weights.len(), other.weights.len());
        debug_assert_eq!(self.biases.len(), other.biases.len());
        for (a, b) in self.weights.iter_mut().zip(&other.weights) {
            *a += *b;
        }
        for (a, b) in self.biases.iter_mut().zip(&other.biases) {
            *a += *b;
        }
    }
}

#[derive(Clone, Debug)]
pub struct DenseLayer {
    input_size: usize,
    output_size: usize,
    /// Row-major `[output_size][input_size]`.
    weights: Vec<f32>,
    biases: Vec<f32>,
    grad_weights: Vec<f32>,
    grad_biases: Vec<f32>,
    last_input: Vec<f32>,
    last_output: Vec<f32>,
}

impl DenseLayer {
    /// He-style init: weights uniform in `±sqrt(2/input_size)`, zero biases.
    pub fn new<R: Rng + ?Sized>(input_size: usize, output_size: usize, rng: &mut R) -> Self {
        assert!(input_size > 0 && output_size > 0, "layer dimensions must be non-zero");
        let scale = (2.0 / input_size as f32).sqrt();
        let weights = (0..input_size * output_size)
            .map(|_| (rng.random::<f32>() - 0.5) * 2.0 * scale)
            .collect();
        Self {
            input_size,
            output_size,
            weights,
            biases: vec![0.0; output_size],
            grad_weights: vec![0.0; input_size * output_size],
            grad_biases: vec![0.0; output_size],
            last_input: Vec::new(),
            last_output: Vec::new(),
        }
    }

    /// Assemble a layer from existing parameters (model load path).
    pub fn from_parameters(
        input_size: usize,
        output_size: usize,
        weights: Vec<f32>,
        biases: Vec<f32>,
    ) -> Self {
        assert!(input_size > 0 && output_size > 0, "layer dimensions must be non-zero");
        assert_eq!(weights.len(), input_size * output_size, "weight matrix shape mismatch");
        assert_eq!(biases.len(), output_size, "bias vector shape mismatch");
        Self {
            input_size,
            output_size,
            weights,
            biases,
            grad_weights: vec![0.0; input_size * output_size],
            grad_biases: vec![0.0; output_size],
            last_input: Vec::new(),
            last_output: Vec::new(),
        }
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn biases(&self) -> &[f32] {
        &self.biases
    }

    pub(crate) fn weights_mut(&mut self) -> &mut [f32] {
        &mut self.weights
    }

    pub(crate) fn biases_mut(&mut self) -> &mut [f32] {
        &mut self.biases
    }

    /// `relu(b_i + Σ_j w_ij x_j)` for every output unit, caching the
    /// activation pair for a subsequent [`DenseLayer::backward_accumulate`].
    pub fn forward(&mut self, input: &[f32]) -> Vec<f32> {
        let output = self.activate(input);
        self.last_input.clear();
        self.last_input.extend_from_slice(input);
        self.last_output.clear();
        self.last_output.extend_from_slice(&output);
        output
    }

    /// Forward pass recording activations into a caller-owned cache instead
    /// of the layer's scratch. Safe to call concurrently.
    pub fn forward_cached(&self, input: &[f32], cache: &mut LayerCache) {
        let output = self.activate(input);
        cache.input.clear();
        cache.input.extend_from_slice(input);
        cache.output = output;
    }

    /// Pure affine+ReLU kernel, bisected over the output-unit range when the
    /// layer is wide enough. Each task writes a disjoint output span, so the
    /// result is bit-identical to the sequential path.
    fn activate(&self, input: &[f32]) -> Vec<f32> {
        assert_eq!(
            input.len(),
            self.input_size,
            "forward: input length {} does not match layer input size {}",
            input.len(),
            self.input_size
        );
        let mut output = vec![0.0f32; self.output_size];
        parallel_chunks(&mut output, UNIT_PAR_THRESHOLD, UNIT_PAR_GRAIN, &|base, chunk| {
            for (k, out) in chunk.iter_mut().enumerate() {
                let i = base + k;
                let row = &self.weights[i * self.input_size..(i + 1) * self.input_size];
                let mut acc = self.biases[i];
                for (w, x) in row.iter().zip(input) {
                    acc += w * x;
                }
                *out = acc.max(0.0);
            }
        });
        output
    }

    /// ReLU-derivative mask, input gradient, and gradient accumulation into
    /// the layer's own buffers, using the scratch of the last `forward`.
    ///
    /// Gradients accumulate across every sample of a mini-batch and are
    /// reset only by [`DenseLayer::update_weights`].
    pub fn backward_accumulate(&mut self, mut output_grad: Vec<f32>) -> Vec<f32> {
        assert!(!self.last_output.is_empty(), "backward_accumulate requires a preceding forward");
        mask_relu(&mut output_grad, &self.last_output);
        let input_grad =
            input_grad_kernel(&self.weights, self.input_size, self.output_size, &output_grad);
        accumulate_kernel(
            &mut self.grad_weights,
            &mut self.grad_biases,
            self.input_size,
            &output_grad,
            &self.last_input,
        );
        input_grad
    }

    /// Backward pass against a caller-owned cache, accumulating into a
    /// task-local buffer. Safe to call concurrently on a shared layer.
    pub fn backward_into(
        &self,
        cache: &LayerCache,
        mut output_grad: Vec<f32>,
        grads: &mut GradBuffer,
    ) -> Vec<f32> {
        mask_relu(&mut output_grad, &cache.output);
        let input_grad =
            input_grad_kernel(&self.weights, self.input_size, self.output_size, &output_grad);
        accumulate_kernel(&mut grads.weights, &mut grads.biases, self.input_size, &output_grad, &cache.input);
        input_grad
    }

    /// Fold a task-local gradient buffer into the layer's accumulators.
    pub fn merge_grads(&mut self, grads: &GradBuffer) {
        assert_eq!(grads.weights.len(), self.grad_weights.len(), "gradient shape mismatch");
        for (a, b) in self.grad_weights.iter_mut().zip(&grads.weights) {
            *a += *b;
        }
        for (a, b) in self.grad_biases.iter_mut().zip(&grads.biases) {
            *a += *b;
        }
    }

    /// Apply `param -= (lr / batch_size) * grad` to every weight and bias,
    /// then zero the accumulators. The only place parameters change; must
    /// run exactly once per mini-batch, after all samples have accumulated.
    pub fn update_weights(&mut self, learning_rate: f32, batch_size: usize) {
        let lr = learning_rate / batch_size as f32;
        for (w, g) in self.weights.iter_mut().zip(self.grad_weights.iter_mut()) {
            *w -= lr * *g;
            *g = 0.0;
        }
        for (b, g) in self.biases.iter_mut().zip(self.grad_biases.iter_mut()) {
            *b -= lr * *g;
            *g = 0.0;
        }
    }

    #[cfg(test)]
    pub(crate) fn grad_l1_norm(&self) -> f32 {
        self.grad_weights.iter().chain(self.grad_biases.iter()).map(|g| g.abs()).sum()
    }
}

/// Zero the gradient wherever the forward activation was clipped by ReLU.
fn mask_relu(output_grad: &mut [f32], output: &[f32]) {
    assert_eq!(output_grad.len(), output.len(), "output gradient length mismatch");
    for (g, o) in output_grad.iter_mut().zip(output) {
        if *o <= 0.0 {
            *g = 0.0;
        }
    }
}

/// `input_grad[j] = Σ_i w_ij g_i`, bisected over the input-index range.
fn input_grad_kernel(weights: &[f32], input_size: usize, output_size: usize, g: &[f32]) -> Vec<f32> {
    let mut input_grad = vec![0.0f32; input_size];
    parallel_chunks(&mut input_grad, UNIT_PAR_THRESHOLD, UNIT_PAR_GRAIN, &|base, chunk| {
        for (k, out) in chunk.iter_mut().enumerate() {
            let j = base + k;
            let mut acc = 0.0f32;
            for i in 0..output_size {
                acc += weights[i * input_size + j] * g[i];
            }
            *out = acc;
        }
    });
    input_grad
}

/// `grad_b[i] += g_i`, `grad_w[i][j] += g_i * x_j`.
fn accumulate_kernel(gw: &mut [f32], gb: &mut [f32], input_size: usize, g: &[f32], x: &[f32]) {
    for (i, gi) in g.iter().enumerate() {
        gb[i] += gi;
        let row = &mut gw[i * input_size..(i + 1) * input_size];
        for (w, xj) in row.iter_mut().zip(x) {
            *w += gi * xj;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn test_rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(0xC0FFEE)
    }

    #[test]
    fn forward_output_length_and_relu_range() {
        let mut rng = test_rng();
        let mut layer = DenseLayer::new(8, 5, &mut rng);
        let out = layer.forward(&[0.5, -1.0, 0.25, 0.0, 1.0, -0.5, 2.0, 0.125]);
        assert_eq!(out.len(), 5);
        assert!(out.iter().all(|v| *v >= 0.0));
    }

    #[test]
    #[should_panic(expected = "input length")]
    fn forward_rejects_dimension_mismatch() {
        let mut rng = test_rng();
        let mut layer = DenseLayer::new(8, 5, &mut rng);
        layer.forward(&[1.0, 2.0]);
    }

    #[test]
    fn parallel_forward_is_bit_identical_to_sequential() {
        // 512 outputs and 300 inputs force the bisected paths in both the
        // forward and the input-gradient kernels.
        let mut rng = test_rng();
        let mut layer = DenseLayer::new(300, 512, &mut rng);
        let input: Vec<f32> = (0..300).map(|i| ((i * 7919) % 32) as f32 / 16.0 - 1.0).collect();
        let out = layer.forward(&input);

        for i in 0..layer.output_size() {
            let row = &layer.weights()[i * 300..(i + 1) * 300];
            let mut acc = layer.biases()[i];
            for (w, x) in row.iter().zip(&input) {
                acc += w * x;
            }
            assert_eq!(out[i].to_bits(), acc.max(0.0).to_bits(), "unit {i}");
        }
    }

    #[test]
    fn parallel_input_grad_is_bit_identical_to_sequential() {
        let mut rng = test_rng();
        let mut layer = DenseLayer::new(512, 300, &mut rng);
        let input: Vec<f32> = (0..512).map(|i| (i % 17) as f32 / 8.0).collect();
        let out = layer.forward(&input);
        let grad: Vec<f32> = (0..300).map(|i| (i as f32 / 300.0) - 0.5).collect();

        let input_grad = layer.backward_accumulate(grad.clone());
        assert_eq!(input_grad.len(), 512);

        let mut masked = grad;
        for (g, o) in masked.iter_mut().zip(&out) {
            if *o <= 0.0 {
                *g = 0.0;
            }
        }
        for j in 0..512 {
            let mut acc = 0.0f32;
            for i in 0..300 {
                acc += layer.weights()[i * 512 + j] * masked[i];
            }
            assert_eq!(input_grad[j].to_bits(), acc.to_bits(), "input {j}");
        }
    }

    #[test]
    fn update_zeroes_gradient_accumulators() {
        let mut rng = test_rng();
        let mut layer = DenseLayer::new(6, 4, &mut rng);
        let input = [1.0, 0.5, -0.25, 2.0, 0.0, 0.75];

        for _ in 0..3 {
            let out = layer.forward(&input);
            let grad = out.iter().map(|v| v - 0.5).collect();
            layer.backward_accumulate(grad);
        }
        assert!(layer.grad_l1_norm() > 0.0);

        layer.update_weights(0.01, 3);
        assert_eq!(layer.grad_l1_norm(), 0.0);
    }

    #[test]
    fn backward_into_matches_backward_accumulate() {
        let mut rng = test_rng();
        let mut layer = DenseLayer::new(6, 4, &mut rng);
        let input = [0.5, 1.0, -1.0, 0.25, 2.0, -0.5];
        let grad = vec![0.1, -0.2, 0.3, -0.4];

        let mut cache = LayerCache::default();
        layer.forward_cached(&input, &mut cache);
        let mut buf = GradBuffer::zeroed(6, 4);
        let ig_pure = layer.backward_into(&cache, grad.clone(), &mut buf);

        let out = layer.forward(&input);
        assert_eq!(out, cache.output);
        let ig_owned = layer.backward_accumulate(grad);
        assert_eq!(ig_pure, ig_owned);

        // Merging the task-local buffer must double the owned accumulators.
        let before = layer.grad_l1_norm();
        layer.merge_grads(&buf);
        assert!((layer.grad_l1_norm() - 2.0 * before).abs() < 1e-4);
    }
}
