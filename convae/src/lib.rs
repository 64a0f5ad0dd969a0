use image::{Rgb, RgbImage};
use ndarray::{ArrayView4, AsArray, Axis, Ix4};

/// Pixels left black between two tiles of a grid.
pub const TILE_GAP: usize = 1;

/// Maps `x` from [min, max] to [0, 255]. A constant tile maps to black.
pub fn to_pixel(x: f32, min: f32, max: f32) -> u8 {
    if max > min {
        ((x - min) / (max - min) * 255.0).round().clamp(0.0, 255.0) as u8
    } else {
        0
    }
}

/// Tiles a batch of images (N, height, width, channels) into a grid with
/// ceil(sqrt(N)) columns.
///
/// Every tile is normalised to its own value range. Images with at least
/// three channels are drawn from their first three channels, all others as
/// grey values of channel 0.
pub fn batch_to_image<'a, V>(images: V) -> RgbImage
where
    V: AsArray<'a, f32, Ix4>,
{
    let images: ArrayView4<f32> = images.into();
    let (count, height, width, channels) = images.dim();
    if count == 0 || height == 0 || width == 0 || channels == 0 {
        return RgbImage::new(0, 0);
    }

    let columns = (count as f64).sqrt().ceil() as usize;
    let rows = (count + columns - 1) / columns;
    let mut grid = RgbImage::new(
        (columns * (width + TILE_GAP) - TILE_GAP) as u32,
        (rows * (height + TILE_GAP) - TILE_GAP) as u32,
    );

    for (index, tile) in images.outer_iter().enumerate() {
        let (min, max) = tile.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
        let top = (index / columns) * (height + TILE_GAP);
        let left = (index % columns) * (width + TILE_GAP);

        for i in 0..height {
            for j in 0..width {
                let pixel = if channels >= 3 {
                    [
                        to_pixel(tile[[i, j, 0]], min, max),
                        to_pixel(tile[[i, j, 1]], min, max),
                        to_pixel(tile[[i, j, 2]], min, max),
                    ]
                } else {
                    let grey = to_pixel(tile[[i, j, 0]], min, max);
                    [grey, grey, grey]
                };
                grid.put_pixel((left + j) as u32, (top + i) as u32, Rgb(pixel));
            }
        }
    }
    grid
}

/// Draws a kernel bank (features, channels, rows, columns) with one tile per
/// feature.
pub fn kernels_to_image<'a, V>(kernels: V) -> RgbImage
where
    V: AsArray<'a, f32, Ix4>,
{
    let kernels: ArrayView4<f32> = kernels.into();
    // (features, rows, columns, channels)
    let mut tiles = kernels;
    tiles.swap_axes(1, 3);
    tiles.swap_axes(1, 2);
    debug_assert_eq!(tiles.len_of(Axis(3)), kernels.len_of(Axis(1)));
    batch_to_image(tiles)
}
