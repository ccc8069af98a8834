//! Validated segmentation settings.
//!
//! The UI posts a flat list of `{name, value}` pairs. [`ParameterSet::from_raw`]
//! turns them into a typed, immutable record once; nothing downstream sees the
//! raw strings.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ParameterError;

/// The five segmentation capabilities, with their slot values already mapped to
/// named, scaled parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SegmentationMethod {
    Watershed {
        smoothing_radius: f64,
        gradient_cut: f64,
    },
    Slic {
        n_segments: u32,
        compactness: f64,
        sigma: f64,
    },
    Quickshift {
        kernel_size: f64,
        max_distance: f64,
        sigma: f64,
    },
    Felzenszwalb {
        scale: f64,
        min_size: usize,
        sigma: f64,
    },
    RemoteModel {
        model_id: u32,
        num_classes: u32,
    },
}

impl SegmentationMethod {
    /// Build a method from the UI algorithm id and its three generic slots.
    ///
    /// 1: watershed, 2: SLIC, 3: quickshift, 4: Felzenszwalb, 5: remote model.
    /// The remote variant takes its model id and class count from `p1`/`p2`.
    pub fn from_slots(algorithm_id: i64, p1: f64, p2: f64, p3: f64) -> Result<Self, ParameterError> {
        for (name, value) in [("parameter_1", p1), ("parameter_2", p2), ("parameter_3", p3)] {
            if !value.is_finite() || value < 0.0 {
                return Err(ParameterError::OutOfRange { name, value });
            }
        }

        let method = match algorithm_id {
            1 => Self::Watershed {
                smoothing_radius: p1,
                gradient_cut: p3,
            },
            2 => {
                let n_segments = (p1 * 25.0) as u32;
                if n_segments == 0 {
                    return Err(ParameterError::OutOfRange {
                        name: "parameter_1",
                        value: p1,
                    });
                }
                Self::Slic {
                    n_segments,
                    compactness: p2,
                    sigma: p3,
                }
            }
            3 => Self::Quickshift {
                kernel_size: p1,
                max_distance: p2,
                sigma: p3,
            },
            4 => Self::Felzenszwalb {
                scale: p1 * 100.0,
                min_size: (p2 * 20.0) as usize,
                sigma: p3,
            },
            5 => Self::RemoteModel {
                model_id: p1 as u32,
                num_classes: (p2 as u32).max(1),
            },
            id => {
                return Err(ParameterError::UnknownId {
                    kind: "segmentation method",
                    id,
                })
            }
        };
        Ok(method)
    }

    pub fn id(&self) -> u8 {
        match self {
            Self::Watershed { .. } => 1,
            Self::Slic { .. } => 2,
            Self::Quickshift { .. } => 3,
            Self::Felzenszwalb { .. } => 4,
            Self::RemoteModel { .. } => 5,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::RemoteModel { .. })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistogramMethod {
    #[default]
    None,
    Global,
    Adaptive,
    Clahe,
}

impl HistogramMethod {
    pub fn from_id(id: i64) -> Result<Self, ParameterError> {
        match id {
            0 => Ok(Self::None),
            1 => Ok(Self::Global),
            2 => Ok(Self::Adaptive),
            3 => Ok(Self::Clahe),
            id => Err(ParameterError::UnknownId {
                kind: "histogram method",
                id,
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantizeMethod {
    AdaptivePalette,
    KMeans,
    RandomSample,
}

impl QuantizeMethod {
    pub fn from_id(id: i64) -> Result<Self, ParameterError> {
        match id {
            1 => Ok(Self::AdaptivePalette),
            2 => Ok(Self::KMeans),
            3 => Ok(Self::RandomSample),
            id => Err(ParameterError::UnknownId {
                kind: "color quantization method",
                id,
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeMethod {
    ThresholdCut,
    NormalizedCut,
    Hierarchical,
}

impl MergeMethod {
    pub fn from_id(id: i64) -> Result<Self, ParameterError> {
        match id {
            1 => Ok(Self::ThresholdCut),
            2 => Ok(Self::NormalizedCut),
            3 => Ok(Self::Hierarchical),
            id => Err(ParameterError::UnknownId {
                kind: "region merge method",
                id,
            }),
        }
    }
}

/// Where post-processing runs when the image is tiled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostprocessScope {
    /// Once, on the stitched image.
    #[default]
    Global,
    /// Inside each tile worker, before stitching.
    PerTile,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quantization {
    pub method: QuantizeMethod,
    pub n_colors: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegionMerge {
    pub method: MergeMethod,
    /// Percentage of the reference image's intensity range. Ignored by
    /// [`MergeMethod::NormalizedCut`].
    pub threshold: f64,
}

/// Tiling layout for parallel segmentation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileConfig {
    pub tile_size: usize,
    pub workers: usize,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            tile_size: 256,
            workers: 10,
        }
    }
}

/// Settings for one segmentation request.
///
/// Disabled steps are `None`; a `Some` value always carries usable settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub method: SegmentationMethod,
    /// Histogram equalization; `None` when light adjustment is off.
    pub light_adjustment: Option<HistogramMethod>,
    pub contrast_stretch: bool,
    pub quantization: Option<Quantization>,
    pub region_merge: Option<RegionMerge>,
    /// Pixel threshold before the ×5 scaling.
    pub small_removal: Option<u32>,
    /// `Some` when tiled multiprocessing is requested.
    pub tiling: Option<TileConfig>,
    pub postprocess_scope: PostprocessScope,
}

impl ParameterSet {
    /// A set with every optional step disabled.
    pub fn new(method: SegmentationMethod) -> Self {
        Self {
            method,
            light_adjustment: None,
            contrast_stretch: false,
            quantization: None,
            region_merge: None,
            small_removal: None,
            tiling: None,
            postprocess_scope: PostprocessScope::Global,
        }
    }

    pub fn with_light_adjustment(mut self, method: HistogramMethod) -> Self {
        self.light_adjustment = Some(method);
        self
    }

    pub fn with_contrast_stretch(mut self) -> Self {
        self.contrast_stretch = true;
        self
    }

    pub fn with_quantization(mut self, method: QuantizeMethod, n_colors: usize) -> Self {
        self.quantization = Some(Quantization { method, n_colors });
        self
    }

    pub fn with_region_merge(mut self, method: MergeMethod, threshold: f64) -> Self {
        self.region_merge = Some(RegionMerge { method, threshold });
        self
    }

    pub fn with_small_removal(mut self, pixel_threshold: u32) -> Self {
        self.small_removal = Some(pixel_threshold);
        self
    }

    pub fn with_tiling(mut self, tiling: TileConfig) -> Self {
        self.tiling = Some(tiling);
        self
    }

    pub fn with_postprocess_scope(mut self, scope: PostprocessScope) -> Self {
        self.postprocess_scope = scope;
        self
    }

    /// Validate the raw UI form.
    pub fn from_raw(raw: &RawParameters) -> Result<Self, ParameterError> {
        let form = raw.as_map();

        let algorithm_id = form.integer("menu")?;
        let p1 = form.number("param1")?;
        let p2 = if algorithm_id == 1 { 0.0 } else { form.number("param2")? };
        let p3 = form.number("param3")?;

        let method = match algorithm_id {
            5 => SegmentationMethod::RemoteModel {
                model_id: form.optional_integer("model_id")?.unwrap_or(1) as u32,
                num_classes: form.optional_integer("num_classes")?.unwrap_or(1).max(1) as u32,
            },
            id => SegmentationMethod::from_slots(id, p1, p2, p3)?,
        };

        let mut params = Self::new(method);

        if form.flag("LightAdjustmentCheck")? {
            let hist = form.optional_integer("hist_method")?.unwrap_or(0);
            params.light_adjustment = Some(HistogramMethod::from_id(hist)?);
        }

        params.contrast_stretch = form.flag("ContrastStretchCheck")?;

        if form.flag("ColorClustCheck")? {
            let method = QuantizeMethod::from_id(form.integer("menuColor")?)?;
            let n_colors = form.integer("Color_Clusters0")?;
            if n_colors < 1 {
                return Err(ParameterError::OutOfRange {
                    name: "Color_Clusters0",
                    value: n_colors as f64,
                });
            }
            params.quantization = Some(Quantization {
                method,
                n_colors: n_colors as usize,
            });
        }

        if form.flag("multiProcessingCheck")? {
            params.tiling = Some(TileConfig::default());
        }

        if form.flag("RAGCheck")? {
            let method = MergeMethod::from_id(form.integer("menuRAG")?)?;
            let threshold = match method {
                MergeMethod::NormalizedCut => 0.0,
                _ => form.number("RAG_Threshold0")?,
            };
            if !(0.0..=100.0).contains(&threshold) {
                return Err(ParameterError::OutOfRange {
                    name: "RAG_Threshold0",
                    value: threshold,
                });
            }
            params.region_merge = Some(RegionMerge { method, threshold });
        }

        if form.flag("small_rem")? {
            let threshold = form.integer("rem_threshold")?;
            if threshold < 0 {
                return Err(ParameterError::OutOfRange {
                    name: "rem_threshold",
                    value: threshold as f64,
                });
            }
            params.small_removal = Some(threshold as u32);
        }

        Ok(params)
    }
}

/// One `{name, value}` entry of the UI form.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawParameter {
    pub name: String,
    pub value: String,
}

/// The UI form exactly as posted.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawParameters(pub Vec<RawParameter>);

impl RawParameters {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    fn as_map(&self) -> Form<'_> {
        Form(
            self.0
                .iter()
                .map(|p| (p.name.as_str(), p.value.trim()))
                .collect(),
        )
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for RawParameters {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, value)| RawParameter {
                    name: name.into(),
                    value: value.into(),
                })
                .collect(),
        )
    }
}

struct Form<'a>(HashMap<&'a str, &'a str>);

impl Form<'_> {
    fn number(&self, name: &'static str) -> Result<f64, ParameterError> {
        let value = self.0.get(name).ok_or(ParameterError::Missing(name))?;
        value.parse::<f64>().map_err(|_| ParameterError::NotANumber {
            name,
            value: value.to_string(),
        })
    }

    fn integer(&self, name: &'static str) -> Result<i64, ParameterError> {
        let value = self.number(name)?;
        if value.fract() != 0.0 {
            return Err(ParameterError::NotANumber {
                name,
                value: value.to_string(),
            });
        }
        Ok(value as i64)
    }

    fn optional_integer(&self, name: &'static str) -> Result<Option<i64>, ParameterError> {
        match self.0.contains_key(name) {
            true => self.integer(name).map(Some),
            false => Ok(None),
        }
    }

    fn flag(&self, name: &'static str) -> Result<bool, ParameterError> {
        Ok(self.integer(name)? == 1)
    }
}
