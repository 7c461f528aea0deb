//! Camera frames and the light preprocessing applied before symbol decoding.

use crate::bridge::protocol::FramePayload;

/// Only 8-bit frames cross the worker boundary.
pub const FRAME_DTYPE: &str = "uint8";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unsupported frame dtype: {0}")]
    UnsupportedDtype(String),

    #[error("unsupported frame shape: {0:?}")]
    BadShape(Vec<usize>),

    #[error("frame data length {actual} does not match shape (expected {expected})")]
    LengthMismatch { expected: usize, actual: usize },
}

/// An 8-bit image, row-major, channels interleaved in BGR(A) order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: usize,
    height: usize,
    channels: usize,
    data: Vec<u8>,
}

impl Frame {
    pub fn new(
        width: usize,
        height: usize,
        channels: usize,
        data: Vec<u8>,
    ) -> Result<Self, FrameError> {
        if !matches!(channels, 1 | 3 | 4) {
            return Err(FrameError::BadShape(vec![height, width, channels]));
        }
        let expected = width * height * channels;
        if data.len() != expected {
            return Err(FrameError::LengthMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// `[h, w]` for single-channel frames, `[h, w, c]` otherwise.
    pub fn shape(&self) -> Vec<usize> {
        if self.channels == 1 {
            vec![self.height, self.width]
        } else {
            vec![self.height, self.width, self.channels]
        }
    }

    /// Crop a landscape frame to its centred square. Portrait and square frames
    /// are returned unchanged.
    pub fn center_square(&self) -> Frame {
        if self.width <= self.height {
            return self.clone();
        }

        let side = self.height;
        let left = (self.width - side) / 2;
        let row_bytes = self.width * self.channels;
        let mut data = Vec::with_capacity(side * side * self.channels);
        for row in self.data.chunks_exact(row_bytes) {
            let start = left * self.channels;
            data.extend_from_slice(&row[start..start + side * self.channels]);
        }

        Frame {
            width: side,
            height: side,
            channels: self.channels,
            data,
        }
    }

    /// Luma conversion with BT.601 weights. Alpha is ignored.
    pub fn to_grayscale(&self) -> Frame {
        if self.channels == 1 {
            return self.clone();
        }

        let data = self
            .data
            .chunks_exact(self.channels)
            .map(|px| {
                let (b, g, r) = (f32::from(px[0]), f32::from(px[1]), f32::from(px[2]));
                (0.114 * b + 0.587 * g + 0.299 * r).round().clamp(0.0, 255.0) as u8
            })
            .collect();

        Frame {
            width: self.width,
            height: self.height,
            channels: 1,
            data,
        }
    }

    pub fn into_payload(self) -> FramePayload {
        FramePayload {
            shape: self.shape(),
            frame_bytes: self.data,
            dtype: FRAME_DTYPE.to_string(),
        }
    }
}

impl TryFrom<FramePayload> for Frame {
    type Error = FrameError;

    fn try_from(payload: FramePayload) -> Result<Self, Self::Error> {
        if payload.dtype != FRAME_DTYPE {
            return Err(FrameError::UnsupportedDtype(payload.dtype));
        }
        let (height, width, channels) = match payload.shape.as_slice() {
            [h, w] => (*h, *w, 1),
            [h, w, c] => (*h, *w, *c),
            _ => return Err(FrameError::BadShape(payload.shape)),
        };
        Frame::new(width, height, channels, payload.frame_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bgr(width: usize, height: usize) -> Frame {
        let data = (0..width * height)
            .flat_map(|i| [i as u8, 0, 0])
            .collect::<Vec<_>>();
        Frame::new(width, height, 3, data).unwrap()
    }

    #[test]
    fn new_rejects_wrong_length() {
        let err = Frame::new(4, 4, 3, vec![0; 10]).unwrap_err();
        assert_eq!(
            err,
            FrameError::LengthMismatch {
                expected: 48,
                actual: 10
            }
        );
    }

    #[test]
    fn center_square_crops_landscape_columns() {
        let frame = bgr(6, 2);
        let square = frame.center_square();

        assert_eq!(square.shape(), vec![2, 2, 3]);
        // Columns 2 and 3 of each row survive; blue channel holds the pixel index.
        let blues: Vec<u8> = square.data().chunks_exact(3).map(|px| px[0]).collect();
        assert_eq!(blues, vec![2, 3, 8, 9]);
    }

    #[test]
    fn center_square_leaves_portrait_alone() {
        let frame = bgr(2, 6);
        assert_eq!(frame.center_square(), frame);
    }

    #[test]
    fn grayscale_uses_bgr_weights() {
        let frame = Frame::new(3, 1, 3, vec![255, 0, 0, 0, 255, 0, 0, 0, 255]).unwrap();
        let gray = frame.to_grayscale();

        assert_eq!(gray.shape(), vec![1, 3]);
        assert_eq!(gray.data(), &[29, 150, 76]);
    }

    #[test]
    fn payload_conversion_keeps_shape() {
        let frame = bgr(4, 3);
        let payload = frame.clone().into_payload();
        assert_eq!(payload.shape, vec![3, 4, 3]);
        assert_eq!(payload.dtype, "uint8");

        assert_eq!(Frame::try_from(payload).unwrap(), frame);
    }

    #[test]
    fn payload_with_float_dtype_is_rejected() {
        let payload = FramePayload {
            frame_bytes: vec![0; 4],
            shape: vec![2, 2],
            dtype: "float32".to_string(),
        };
        assert_eq!(
            Frame::try_from(payload).unwrap_err(),
            FrameError::UnsupportedDtype("float32".to_string())
        );
    }
}
