use ndarray::ArrayView3;

use super::bounding_box::BoundingBox;

/// A decoded video frame: contiguous RGB bytes in row-major order.
///
/// Decoding happens once at intake; everything downstream treats pixel
/// data as an opaque `height × width × channels` buffer.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    channels: u8,
    frame_id: u64,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, channels: u8, frame_id: u64) -> Self {
        debug_assert_eq!(
            data.len(),
            (width as usize) * (height as usize) * (channels as usize),
            "data length must equal width * height * channels"
        );
        Self {
            data,
            width,
            height,
            channels,
            frame_id,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    pub fn as_ndarray(&self) -> ArrayView3<'_, u8> {
        ArrayView3::from_shape(self.shape(), &self.data)
            .expect("Frame data length must match dimensions")
    }

    /// Copies the pixels under `region` into a new frame.
    ///
    /// The region is clamped to the frame first; `None` if it lies fully
    /// outside.
    pub fn crop(&self, region: &BoundingBox) -> Option<Frame> {
        let clamped = region.clamped(self.width, self.height)?;
        let ch = self.channels as usize;
        let src_stride = self.width as usize * ch;
        let row_len = clamped.width as usize * ch;

        let mut data = Vec::with_capacity(row_len * clamped.height as usize);
        for row in clamped.y as usize..(clamped.y + clamped.height) as usize {
            let start = row * src_stride + clamped.x as usize * ch;
            data.extend_from_slice(&self.data[start..start + row_len]);
        }

        Some(Frame::new(
            data,
            clamped.width as u32,
            clamped.height as u32,
            self.channels,
            self.frame_id,
        ))
    }

    fn shape(&self) -> (usize, usize, usize) {
        (
            self.height as usize,
            self.width as usize,
            self.channels as usize,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Each pixel's R channel encodes its column, G its row.
    fn gradient(width: u32, height: u32) -> Frame {
        let mut data = Vec::new();
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[x as u8, y as u8, 0]);
            }
        }
        Frame::new(data, width, height, 3, 9)
    }

    #[test]
    fn test_construction_and_accessors() {
        let data = vec![0u8; 12];
        let frame = Frame::new(data.clone(), 2, 2, 3, 5);
        assert_eq!(frame.width(), 2);
        assert_eq!(frame.height(), 2);
        assert_eq!(frame.channels(), 3);
        assert_eq!(frame.frame_id(), 5);
        assert_eq!(frame.data(), &data[..]);
    }

    #[test]
    #[should_panic(expected = "data length must equal width * height * channels")]
    fn test_mismatched_data_length_panics_in_debug() {
        Frame::new(vec![0u8; 10], 2, 2, 3, 0);
    }

    #[test]
    fn test_as_ndarray_shape() {
        let frame = Frame::new(vec![0u8; 24], 4, 2, 3, 0);
        assert_eq!(frame.as_ndarray().shape(), &[2, 4, 3]);
    }

    #[test]
    fn test_crop_copies_region() {
        let frame = gradient(10, 8);
        let crop = frame.crop(&BoundingBox::new(2, 3, 4, 2)).unwrap();

        assert_eq!(crop.width(), 4);
        assert_eq!(crop.height(), 2);
        assert_eq!(crop.frame_id(), 9);
        let arr = crop.as_ndarray();
        assert_eq!(arr[[0, 0, 0]], 2); // column 2
        assert_eq!(arr[[0, 0, 1]], 3); // row 3
        assert_eq!(arr[[1, 3, 0]], 5);
        assert_eq!(arr[[1, 3, 1]], 4);
    }

    #[test]
    fn test_crop_clamps_to_frame() {
        let frame = gradient(10, 10);
        let crop = frame.crop(&BoundingBox::new(-4, 6, 8, 8)).unwrap();
        assert_eq!(crop.width(), 4);
        assert_eq!(crop.height(), 4);
        assert_eq!(crop.as_ndarray()[[0, 0, 1]], 6);
    }

    #[test]
    fn test_crop_outside_frame_is_none() {
        let frame = gradient(10, 10);
        assert!(frame.crop(&BoundingBox::new(20, 20, 5, 5)).is_none());
    }
}
