use std::sync::Arc;

use anyhow::{anyhow, bail, ensure};
use ndarray::{Array2, Axis, Slice};

/// A single-channel, single-polarisation sky image.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    /// Pixel values, indexed `[y, x]`.
    pub data: Array2<f64>,
    /// Channel frequencies in Hz.
    pub frequency: Vec<f64>,
    /// Angular size of a pixel in radians.
    pub cellsize: f64,
}

impl Image {
    pub fn npixel(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// Copies the pixels under `window` into a new image with the same
    /// metadata.
    pub fn facet(&self, window: &Window) -> Image {
        let data = self
            .data
            .slice_axis(Axis(0), window.rows())
            .slice_axis(Axis(1), window.cols())
            .to_owned();

        Image {
            data,
            frequency: self.frequency.clone(),
            cellsize: self.cellsize,
        }
    }

    /// Writes `patch` back into the pixels under `window`.
    pub fn insert(&mut self, window: &Window, patch: &Image) -> anyhow::Result<()> {
        ensure!(
            patch.npixel() == (window.ny, window.nx),
            "facet of shape {:?} does not fit window {window:?}",
            patch.npixel()
        );

        self.data
            .slice_axis_mut(Axis(0), window.rows())
            .slice_axis_mut(Axis(1), window.cols())
            .assign(&patch.data);
        Ok(())
    }
}

/// Parameters of [`create_test_image`].
#[derive(Debug, Clone)]
pub struct TestImage {
    pub npixel: usize,
    pub frequency: Vec<f64>,
    pub cellsize: f64,
}

impl Default for TestImage {
    fn default() -> Self {
        Self {
            npixel: 256,
            frequency: vec![1e8],
            cellsize: 0.001,
        }
    }
}

/// Builds a deterministic model image: a ringing central source on top of a
/// faint ripple, with both positive and negative pixels.
pub fn create_test_image(params: &TestImage) -> anyhow::Result<Image> {
    ensure!(params.npixel > 0, "test image needs at least one pixel");
    ensure!(!params.frequency.is_empty(), "test image needs a frequency");

    let n = params.npixel as f64;
    let centre = n / 2.0;

    let data = Array2::from_shape_fn((params.npixel, params.npixel), |(y, x)| {
        let (dy, dx) = (y as f64 - centre, x as f64 - centre);
        let r = (dx * dx + dy * dy).sqrt() / n;
        let source = (-(8.0 * r).powi(2)).exp() * (40.0 * r).cos();
        let ripple = 0.05 * (0.3 * x as f64).sin() * (0.2 * y as f64).cos();
        source + ripple
    });

    Ok(Image {
        data,
        frequency: params.frequency.clone(),
        cellsize: params.cellsize,
    })
}

/// A rectangular region of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub y: usize,
    pub x: usize,
    pub ny: usize,
    pub nx: usize,
}

impl Window {
    fn rows(&self) -> Slice {
        Slice::from(self.y..self.y + self.ny)
    }

    fn cols(&self) -> Slice {
        Slice::from(self.x..self.x + self.nx)
    }
}

/// Iterator over the `facets × facets` windows of an image, row by row.
#[derive(Debug, Clone)]
pub struct RasterIter {
    facets: usize,
    ny: usize,
    nx: usize,
    next: usize,
}

impl Iterator for RasterIter {
    type Item = Window;

    fn next(&mut self) -> Option<Window> {
        if self.next >= self.facets * self.facets {
            return None;
        }

        let (row, col) = (self.next / self.facets, self.next % self.facets);
        self.next += 1;

        Some(Window {
            y: row * self.ny,
            x: col * self.nx,
            ny: self.ny,
            nx: self.nx,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.facets * self.facets - self.next.min(self.facets * self.facets);
        (left, Some(left))
    }
}

impl ExactSizeIterator for RasterIter {}

/// Splits `image` into `facets × facets` equal windows. Both image axes
/// must be divisible by `facets`.
pub fn image_raster_iter(image: &Image, facets: usize) -> anyhow::Result<RasterIter> {
    ensure!(facets > 0, "number of facets must be positive");

    let (ny, nx) = image.npixel();
    if ny % facets != 0 || nx % facets != 0 {
        bail!("image of {ny}x{nx} pixels cannot be split into {facets}x{facets} facets");
    }

    Ok(RasterIter {
        facets,
        ny: ny / facets,
        nx: nx / facets,
        next: 0,
    })
}

/// Selects one facet out of a `facets × facets` raster.
#[derive(Debug, Clone, Copy)]
pub struct FacetIndex {
    pub facets: usize,
    pub index: usize,
}

/// Cuts facet `facet.index` out of `image`.
pub fn extract_facet(image: &Image, facet: &FacetIndex) -> anyhow::Result<Image> {
    let window = image_raster_iter(image, facet.facets)?
        .nth(facet.index)
        .ok_or_else(|| anyhow!("facet {} is out of range", facet.index))?;
    Ok(image.facet(&window))
}

/// Pastes facets given in raster order over a copy of `model`.
pub fn assemble_facets(model: &Image, parts: &Vec<Arc<Image>>) -> anyhow::Result<Image> {
    let facets = (parts.len() as f64).sqrt().round() as usize;
    ensure!(
        facets * facets == parts.len(),
        "{} facets do not form a square raster",
        parts.len()
    );

    let mut image = model.clone();
    for (window, part) in image_raster_iter(model, facets)?.zip(parts) {
        image.insert(&window, part)?;
    }

    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(npixel: usize) -> Image {
        create_test_image(&TestImage {
            npixel,
            ..TestImage::default()
        })
        .unwrap()
    }

    #[test]
    fn test_test_image_has_both_signs() {
        let image = small(64);
        assert_eq!(image.npixel(), (64, 64));
        assert_eq!(image.frequency, vec![1e8]);
        assert!(image.data.iter().any(|&x| x > 0.0));
        assert!(image.data.iter().any(|&x| x < 0.0));
        assert_eq!(image, small(64));
    }

    #[test]
    fn test_raster_covers_image() {
        let image = small(16);
        let windows: Vec<_> = image_raster_iter(&image, 4).unwrap().collect();

        assert_eq!(windows.len(), 16);
        assert_eq!(windows[0], Window { y: 0, x: 0, ny: 4, nx: 4 });
        assert_eq!(windows[1], Window { y: 0, x: 4, ny: 4, nx: 4 });
        assert_eq!(windows[4], Window { y: 4, x: 0, ny: 4, nx: 4 });
        assert_eq!(windows.iter().map(|w| w.ny * w.nx).sum::<usize>(), 256);
    }

    #[test]
    fn test_raster_rejects_uneven_split() {
        assert!(image_raster_iter(&small(10), 4).is_err());
        assert!(image_raster_iter(&small(10), 0).is_err());
    }

    #[test]
    fn test_extract_and_assemble() {
        let image = small(32);
        let parts = (0..16)
            .map(|index| extract_facet(&image, &FacetIndex { facets: 4, index }).map(Arc::new))
            .collect::<anyhow::Result<Vec<_>>>()
            .unwrap();

        assert_eq!(parts[5].npixel(), (8, 8));
        assert_eq!(parts[5].data[[0, 0]], image.data[[8, 8]]);

        let blank = Image {
            data: Array2::zeros((32, 32)),
            ..image.clone()
        };
        assert_eq!(assemble_facets(&blank, &parts).unwrap(), image);
    }

    #[test]
    fn test_facet_window_axes() {
        let mut image = Image {
            data: Array2::from_shape_fn((6, 8), |(y, x)| (y * 10 + x) as f64),
            frequency: vec![1e8],
            cellsize: 0.001,
        };
        let window = Window { y: 2, x: 5, ny: 3, nx: 2 };

        let facet = image.facet(&window);
        assert_eq!(facet.npixel(), (3, 2));
        assert_eq!(facet.data[[0, 0]], 25.0);
        assert_eq!(facet.data[[2, 1]], 46.0);

        let patch = Image {
            data: Array2::from_elem((3, 2), -1.0),
            ..facet
        };
        image.insert(&window, &patch).unwrap();
        assert_eq!(image.data[[2, 5]], -1.0);
        assert_eq!(image.data[[4, 6]], -1.0);
        assert_eq!(image.data[[4, 7]], 47.0);
        assert_eq!(image.data.iter().filter(|&&x| x == -1.0).count(), 6);

        let wrong = Window { ny: 2, nx: 3, ..window };
        assert!(image.insert(&wrong, &patch).is_err());
    }

    #[test]
    fn test_extract_out_of_range() {
        let err = extract_facet(&small(8), &FacetIndex { facets: 2, index: 4 }).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }
}
