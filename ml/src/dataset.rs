//! Loading image sets stored as named arrays of an `.npz` archive.
use log::{debug, info};
use ndarray::*;
use ndarray_npy::{NpzReader, ReadNpzError};
use std::io::{Cursor, Read, Seek};
use std::path::Path;
use thiserror::Error;

use crate::ImagePrecision;

pub type DatasetResult<T> = Result<T, DatasetError>;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Dataset file not found. Filesystem reported error\n {0}.")]
    Io(#[from] std::io::Error),
    #[error("Dataset archive not readable:\n {0}.")]
    Npz(#[from] ReadNpzError),
    #[error("Images could not be reshaped:\n {0}.")]
    Shape(#[from] ShapeError),
    #[error("Array {name} holds {len} values, which is not a multiple of the image size {image_size}.")]
    SizeMismatch {
        name: String,
        len: usize,
        image_size: usize,
    },
}

pub struct NpzDatasetLoader<R>
where
    R: Seek + Read,
{
    handle: R,
}

impl NpzDatasetLoader<std::fs::File> {
    pub fn from_path<P: AsRef<Path>>(path: P) -> DatasetResult<NpzDatasetLoader<std::fs::File>> {
        let handle = std::fs::File::open(path)?;
        Ok(NpzDatasetLoader { handle })
    }
}

impl NpzDatasetLoader<Cursor<&[u8]>> {
    pub fn from_buffer(bytes_array: &[u8]) -> NpzDatasetLoader<Cursor<&[u8]>> {
        NpzDatasetLoader {
            handle: Cursor::new(bytes_array),
        }
    }
}

impl<R> NpzDatasetLoader<R>
where
    R: Seek + Read,
{
    /// Names of the arrays in the archive.
    pub fn names(&mut self) -> DatasetResult<Vec<String>> {
        let mut reader = NpzReader::new(&mut self.handle)?;
        Ok(reader.names()?)
    }

    /// Reads the array `name` and reshapes it into images of shape
    /// (N, height, width, channels), keeping at most `limit` images.
    ///
    /// The array may have any dimension as long as its elements are stored
    /// image after image in row major order. Both `f32` and `f64` arrays are
    /// accepted.
    pub fn load_images(
        &mut self,
        name: &str,
        image_shape: (usize, usize, usize),
        limit: Option<usize>,
    ) -> DatasetResult<Array4<ImagePrecision>> {
        let values: Vec<ImagePrecision> = self.read_array(name)?.iter().copied().collect();
        let (height, width, channels) = image_shape;
        let image_size = height * width * channels;
        if image_size == 0 || values.len() % image_size != 0 {
            return Err(DatasetError::SizeMismatch {
                name: name.to_string(),
                len: values.len(),
                image_size,
            });
        }

        let available = values.len() / image_size;
        let count = limit.map_or(available, |limit| limit.min(available));
        let mut values = values;
        values.truncate(count * image_size);

        let images = Array::from_shape_vec((count, height, width, channels), values)?;
        info!(
            "Loaded {} images of shape {:?} from array {}",
            count, image_shape, name
        );
        Ok(images)
    }

    /// Reads a three dimensional array `name` of shape (height, width, N),
    /// the samples stacked along the last axis, into single channel images
    /// of shape (N, height, width, 1).
    pub fn load_samples_last(
        &mut self,
        name: &str,
        limit: Option<usize>,
    ) -> DatasetResult<Array4<ImagePrecision>> {
        let planes = self.read_array(name)?.into_dimensionality::<Ix3>()?;
        let available = planes.len_of(Axis(2));
        let count = limit.map_or(available, |limit| limit.min(available));

        let images = planes
            .slice(s![.., .., ..count])
            .permuted_axes([2, 0, 1])
            .insert_axis(Axis(3))
            .as_standard_layout()
            .into_owned();
        info!(
            "Loaded {} images of shape {:?} from array {}",
            count,
            &images.shape()[1..],
            name
        );
        Ok(images)
    }

    fn read_array(&mut self, name: &str) -> DatasetResult<ArrayD<ImagePrecision>> {
        // the reader needs to be rebuilt to read a second array
        let single: Result<ArrayD<f32>, _> = NpzReader::new(&mut self.handle)?.by_name(name);
        match single {
            Ok(arr) => Ok(arr),
            Err(ReadNpzError::Npy(e)) => {
                debug!("Array {} is not f32 ({}), trying f64", name, e);
                let double: ArrayD<f64> = NpzReader::new(&mut self.handle)?.by_name(name)?;
                Ok(double.mapv(|v| v as ImagePrecision))
            }
            Err(e) => Err(e.into()),
        }
    }
}
