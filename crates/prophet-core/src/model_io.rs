//! Binary model persistence.
//!
//! Flat big-endian layout, no compression:
//!
//! ```text
//! i32 layer_count
//! per layer:
//!     i32 output_size
//!     i32 input_size
//!     output_size * input_size  f32 weights (row-major)
//!     output_size               f32 biases
//! ```
//!
//! There is no magic number, version field or checksum; any layout change is
//! a breaking change for existing model files. Corruption or premature EOF
//! fails the whole load and callers fall back to a fresh network.

use crate::layer::DenseLayer;
use crate::network::Network;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Upper bound on any single dimension read from disk; anything past this is
/// treated as file corruption rather than a real topology.
const MAX_DIM: usize = 1 << 20;
const MAX_LAYERS: usize = 1024;

/// Write all layer shapes, weights and biases to `path`.
pub fn save<P: AsRef<Path>>(network: &Network, path: P) -> io::Result<()> {
    let file = File::create(path)?;
    let mut w = BufWriter::new(file);
    write_network(network, &mut w)?;
    w.flush()
}

fn write_network<W: Write>(network: &Network, w: &mut W) -> io::Result<()> {
    w.write_i32::<BigEndian>(network.layers().len() as i32)?;
    for layer in network.layers() {
        w.write_i32::<BigEndian>(layer.output_size() as i32)?;
        w.write_i32::<BigEndian>(layer.input_size() as i32)?;
        for v in layer.weights() {
            w.write_f32::<BigEndian>(*v)?;
        }
        for v in layer.biases() {
            w.write_f32::<BigEndian>(*v)?;
        }
    }
    Ok(())
}

/// Reconstruct a network from `path` with the topology declared on disk.
pub fn load<P: AsRef<Path>>(path: P, learning_rate: f32) -> io::Result<Network> {
    let file = File::open(path)?;
    let mut r = BufReader::new(file);

    let count = read_dim(&mut r, MAX_LAYERS, "layer count")?;
    let mut layers: Vec<DenseLayer> = Vec::with_capacity(count);
    for _ in 0..count {
        let (input_size, output_size, weights, biases) = read_layer(&mut r)?;
        if let Some(prev) = layers.last()
            && prev.output_size() != input_size
        {
            return Err(invalid(format!(
                "layer chain broken on disk: {} outputs feeding {} inputs",
                prev.output_size(),
                input_size
            )));
        }
        layers.push(DenseLayer::from_parameters(input_size, output_size, weights, biases));
    }
    Ok(Network::from_layers(layers, learning_rate))
}

/// Load weights from `path` into an existing network.
///
/// With `allow_partial = false` (the default everywhere), any difference in
/// layer count or per-layer shape is an `InvalidData` error. With
/// `allow_partial = true` only the overlapping rectangle of each weight
/// matrix (and bias prefix) is copied and everything outside the overlap is
/// left untouched, a tolerance for resuming into a slightly different
/// architecture, opt-in because it silently drops weights.
pub fn load_into<P: AsRef<Path>>(
    network: &mut Network,
    path: P,
    allow_partial: bool,
) -> io::Result<()> {
    let file = File::open(path)?;
    let mut r = BufReader::new(file);

    let count = read_dim(&mut r, MAX_LAYERS, "layer count")?;
    if !allow_partial && count != network.layers().len() {
        return Err(invalid(format!(
            "layer count mismatch: file has {count}, network has {}",
            network.layers().len()
        )));
    }

    let usable = count.min(network.layers().len());
    for l in 0..usable {
        let (file_in, file_out, weights, biases) = read_layer(&mut r)?;
        let layer = &mut network.layers_mut()[l];
        let (net_in, net_out) = (layer.input_size(), layer.output_size());

        if file_in == net_in && file_out == net_out {
            layer.weights_mut().copy_from_slice(&weights);
            layer.biases_mut().copy_from_slice(&biases);
            continue;
        }
        if !allow_partial {
            return Err(invalid(format!(
                "layer {l} shape mismatch: file {file_out}x{file_in}, network {net_out}x{net_in}"
            )));
        }

        let rows = file_out.min(net_out);
        let cols = file_in.min(net_in);
        for i in 0..rows {
            let src = &weights[i * file_in..i * file_in + cols];
            layer.weights_mut()[i * net_in..i * net_in + cols].copy_from_slice(src);
        }
        layer.biases_mut()[..rows].copy_from_slice(&biases[..rows]);
        log::warn!(
            "partial load of layer {l}: copied {rows}x{cols} of file {file_out}x{file_in} into network {net_out}x{net_in}"
        );
    }
    Ok(())
}

fn read_layer<R: Read>(r: &mut R) -> io::Result<(usize, usize, Vec<f32>, Vec<f32>)> {
    let output_size = read_dim(r, MAX_DIM, "output size")?;
    let input_size = read_dim(r, MAX_DIM, "input size")?;
    let mut weights = vec![0.0f32; input_size * output_size];
    r.read_f32_into::<BigEndian>(&mut weights)?;
    let mut biases = vec![0.0f32; output_size];
    r.read_f32_into::<BigEndian>(&mut biases)?;
    Ok((input_size, output_size, weights, biases))
}

fn read_dim<R: Read>(r: &mut R, max: usize, what: &str) -> io::Result<usize> {
    let v = r.read_i32::<BigEndian>()?;
    if v <= 0 || v as usize > max {
        return Err(invalid(format!("implausible {what} in model file: {v}")));
    }
    Ok(v as usize)
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}
