//! Star records: focal-plane position, auxiliary properties, an optional pixel
//! stamp, and the fitted parameter vector written by models and interpolators.
//!
//! A [`Star`] is created by the I/O layer. The calibration engine only ever
//! replaces its [`StarFit`]; position, properties and stamp are copied through
//! untouched.

use std::collections::BTreeMap;

use crate::error::{PsfError, Result};

/// Pixel cutout around a star with its inverse-variance weight map.
///
/// Pixels are row-major, `pixels[row * width + col]`. Pixel `(col, row)` sits at
/// sky offset `((col - center_x) * scale, (row - center_y) * scale)` from the
/// star's nominal position.
#[derive(Debug, Clone, PartialEq)]
pub struct Stamp {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<f64>,
    /// Inverse variance per pixel; zero marks a masked pixel.
    pub weight: Vec<f64>,
    /// Sky units (e.g. arcsec) per pixel.
    pub scale: f64,
    /// Nominal star position in pixel coordinates.
    pub center_x: f64,
    pub center_y: f64,
}

impl Stamp {
    /// Blank stamp of the given size with uniform weight, centred on the
    /// geometric centre of the array.
    pub fn new(width: usize, height: usize, scale: f64, weight: f64) -> Self {
        Self {
            width,
            height,
            pixels: vec![0.0; width * height],
            weight: vec![weight; width * height],
            scale,
            center_x: width as f64 / 2.0,
            center_y: height as f64 / 2.0,
        }
    }

    /// Build a stamp from raw row-major pixels and weights.
    pub fn from_raw(
        pixels: Vec<f64>,
        weight: Vec<f64>,
        width: usize,
        height: usize,
        scale: f64,
    ) -> Result<Self> {
        if pixels.len() != width * height || weight.len() != width * height {
            return Err(PsfError::Configuration(format!(
                "stamp data length ({} pixels, {} weights) does not match {}x{}",
                pixels.len(),
                weight.len(),
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
            weight,
            scale,
            center_x: width as f64 / 2.0,
            center_y: height as f64 / 2.0,
        })
    }

    /// Sky offset `(du, dv)` of a pixel centre from the nominal star position.
    #[inline]
    pub fn sky_offset(&self, col: usize, row: usize) -> (f64, f64) {
        (
            (col as f64 - self.center_x) * self.scale,
            (row as f64 - self.center_y) * self.scale,
        )
    }

    /// Number of pixels with non-zero weight.
    pub fn n_valid(&self) -> usize {
        self.weight.iter().filter(|&&w| w > 0.0).count()
    }

    /// Copy of this stamp with new pixel values (same geometry and weights).
    pub fn with_pixels(&self, pixels: Vec<f64>) -> Self {
        Self {
            pixels,
            ..self.clone()
        }
    }
}

/// Convert an image into a stamp with uniform weight.
///
/// Colour images are reduced to luma with Rec. 709 coefficients.
#[cfg(feature = "image")]
pub fn stamp_from_image(img: &image::DynamicImage, scale: f64, weight: f64) -> Stamp {
    use image::{DynamicImage, GenericImageView};
    let (w, h) = img.dimensions();
    let pixels: Vec<f64> = match img {
        DynamicImage::ImageLuma16(g) => g.as_raw().iter().map(|&v| v as f64).collect(),
        DynamicImage::ImageRgb32F(rgb) => rgb
            .pixels()
            .map(|p| {
                let [r, g, b] = p.0;
                0.2126 * r as f64 + 0.7152 * g as f64 + 0.0722 * b as f64
            })
            .collect(),
        _ => img.to_luma8().as_raw().iter().map(|&v| v as f64).collect(),
    };
    let mut stamp = Stamp::new(w as usize, h as usize, scale, weight);
    stamp.pixels = pixels;
    stamp
}

/// Position and observed data of a star.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StarData {
    /// Focal-plane coordinate u.
    pub u: f64,
    /// Focal-plane coordinate v.
    pub v: f64,
    /// Extra named scalars usable as interpolation attributes (e.g. colour,
    /// CCD number, exposure-level quantities).
    pub properties: BTreeMap<String, f64>,
    pub stamp: Option<Stamp>,
}

impl StarData {
    pub fn new(u: f64, v: f64) -> Self {
        Self {
            u,
            v,
            ..Default::default()
        }
    }

    /// Look up an interpolation attribute: `"u"`, `"v"`, or a property name.
    pub fn attribute(&self, name: &str) -> Option<f64> {
        match name {
            "u" => Some(self.u),
            "v" => Some(self.v),
            _ => self.properties.get(name).copied(),
        }
    }
}

/// Result of the most recent local fit (or interpolation) for a star.
#[derive(Debug, Clone, PartialEq)]
pub struct StarFit {
    /// Fitted parameter vector; its meaning is defined by the model in use.
    pub params: Vec<f64>,
    pub flux: f64,
    /// Centroid offset from the nominal position, sky units.
    pub center: (f64, f64),
    pub chisq: Option<f64>,
    pub dof: Option<usize>,
}

impl StarFit {
    /// Unit-flux fit with the given parameters and no chi-square.
    pub fn new(params: Vec<f64>) -> Self {
        Self {
            params,
            flux: 1.0,
            center: (0.0, 0.0),
            chisq: None,
            dof: None,
        }
    }
}

/// A star: observed data plus an optional fit.
#[derive(Debug, Clone, PartialEq)]
pub struct Star {
    pub data: StarData,
    pub fit: Option<StarFit>,
}

impl Star {
    pub fn new(data: StarData) -> Self {
        Self { data, fit: None }
    }

    /// Star with a fit carrying `params`.
    pub fn with_params(data: StarData, params: Vec<f64>) -> Self {
        Self {
            data,
            fit: Some(StarFit::new(params)),
        }
    }

    /// Copy of this star with its fit replaced.
    pub fn with_fit(&self, fit: StarFit) -> Self {
        Self {
            data: self.data.clone(),
            fit: Some(fit),
        }
    }

    /// Copy of this star with new fit parameters. Flux, centre and
    /// chi-square from an existing fit are kept.
    pub fn with_fit_params(&self, params: Vec<f64>) -> Self {
        let fit = match &self.fit {
            Some(f) => StarFit {
                params,
                ..f.clone()
            },
            None => StarFit::new(params),
        };
        self.with_fit(fit)
    }

    /// Fitted parameters, or a configuration error if the star was never fit.
    pub fn params(&self) -> Result<&[f64]> {
        self.fit
            .as_ref()
            .map(|f| f.params.as_slice())
            .ok_or_else(|| PsfError::Configuration("star has no fitted parameters".into()))
    }

    pub fn stamp(&self) -> Result<&Stamp> {
        self.data
            .stamp
            .as_ref()
            .ok_or_else(|| PsfError::Configuration("star has no pixel stamp".into()))
    }
}
