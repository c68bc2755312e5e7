//! Flat text persistence of parameter tensors.
//!
//! Each tensor is one line of whitespace-separated values in row-major order.
//! Shapes are not stored: a line is read back into a live tensor whose shape
//! decides how many values are expected.

use crate::backends::{Scalar, Tensor};
use crate::error::{NetError, Result};

use std::io::{BufRead, Write};
use std::str::FromStr;

pub fn write_tensor<T: Scalar, B: Tensor<T>, W: Write>(writer: &mut W, tensor: &B) -> Result<()> {
    let line = tensor
        .get_data()
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    writeln!(writer, "{}", line)?;
    Ok(())
}

/// Reads the next line of `reader` into `tensor`, keeping its shape.
pub fn read_tensor_into<T, B, R>(reader: &mut R, name: &str, tensor: &mut B) -> Result<()>
where
    T: Scalar + FromStr,
    B: Tensor<T>,
    R: BufRead,
{
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(NetError::Parse(format!("no values left for '{}'", name)));
    }
    let values = line
        .split_whitespace()
        .map(|token| {
            token
                .parse::<T>()
                .map_err(|_| NetError::Parse(format!("'{}' is not a number (in '{}')", token, name)))
        })
        .collect::<Result<Vec<T>>>()?;

    if values.len() != tensor.size() {
        return Err(NetError::WeightCount {
            name: name.to_string(),
            expected: tensor.size(),
            actual: values.len(),
        });
    }
    *tensor = B::from_shape_vec(&tensor.shape(), values)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::cpu::CpuTensor;
    use ndarray::array;
    use std::io::Cursor;

    #[test]
    fn test_write_then_read() {
        let tensor = CpuTensor::new(array![[1.5, -2.0], [0.25, 3.0]].into_dyn());
        let mut buffer = Vec::new();
        write_tensor(&mut buffer, &tensor).unwrap();
        assert_eq!(String::from_utf8(buffer.clone()).unwrap(), "1.5 -2 0.25 3\n");

        let mut restored = CpuTensor::<f64>::zeros(&[2, 2]);
        read_tensor_into(&mut Cursor::new(buffer), "w", &mut restored).unwrap();
        assert_eq!(restored.get_data(), tensor.get_data());
    }

    #[test]
    fn test_count_and_parse_errors() {
        let mut tensor = CpuTensor::<f32>::zeros(&[3]);
        let err = read_tensor_into(&mut Cursor::new("1 2\n"), "bias", &mut tensor).unwrap_err();
        assert!(matches!(err, NetError::WeightCount { expected: 3, actual: 2, .. }));
        assert!(matches!(
            read_tensor_into(&mut Cursor::new("1 x 3\n"), "bias", &mut tensor),
            Err(NetError::Parse(_))
        ));
        assert!(matches!(read_tensor_into(&mut Cursor::new(""), "bias", &mut tensor), Err(NetError::Parse(_))));
    }
}
