//! Pre-classification gate: a general-purpose detector decides whether an
//! upload plausibly shows a cat or a dog before the domain model runs.

use std::{fs, path::Path, sync::Arc};

use image::RgbImage;
use pawgate_learning::{
    classifier::backbone::PooledColourBackbone, persist, preprocess::has_image_extension,
    Preprocessor,
};
use serde::{Deserialize, Serialize};

use crate::error::{ServingError, ServingResult};

/// Detector labels that count as a cat or a dog, wild felids and canids included.
pub const CAT_DOG_LABELS: [&str; 63] = [
    "tabby",
    "tiger_cat",
    "persian_cat",
    "siamese_cat",
    "egyptian_cat",
    "cougar",
    "lynx",
    "leopard",
    "cheetah",
    "jaguar",
    "lion",
    "tiger",
    "pug",
    "chihuahua",
    "pomeranian",
    "german_shepherd",
    "golden_retriever",
    "labrador_retriever",
    "beagle",
    "bulldog",
    "boxer",
    "rottweiler",
    "dalmatian",
    "saint_bernard",
    "husky",
    "great_dane",
    "standard_poodle",
    "terrier",
    "yorkshire_terrier",
    "cocker_spaniel",
    "irish_setter",
    "english_setter",
    "border_collie",
    "collie",
    "malamute",
    "kelpie",
    "komondor",
    "old_english_sheepdog",
    "shetland_sheepdog",
    "basenji",
    "leonberg",
    "newfoundland",
    "great_pyrenees",
    "samoyed",
    "malinois",
    "keeshond",
    "brabancon_griffon",
    "cardigan",
    "pembroke",
    "toy_poodle",
    "miniature_poodle",
    "white_wolf",
    "red_wolf",
    "coyote",
    "dingo",
    "african_hunting_dog",
    "hyena",
    "red_fox",
    "kit_fox",
    "arctic_fox",
    "grey_fox",
    "timber_wolf",
    "mexican_hairless",
];

/// True if `label` is in [`CAT_DOG_LABELS`]; case and space/underscore insensitive.
#[must_use]
pub fn is_cat_or_dog_label(label: &str) -> bool {
    let normalised = label.trim().to_ascii_lowercase().replace(|c: char| c == ' ' || c == '-', "_");
    CAT_DOG_LABELS.contains(&normalised.as_str())
}

/// Display form of a detector label: underscores become spaces and each word
/// is capitalised (`sports_car` -> `Sports Car`).
#[must_use]
pub fn display_label(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    let mut word_start = true;
    for ch in label.chars() {
        let ch = if ch == '_' { ' ' } else { ch };
        if ch.is_alphabetic() {
            if word_start {
                out.extend(ch.to_uppercase());
            } else {
                out.extend(ch.to_lowercase());
            }
            word_start = false;
        } else {
            out.push(ch);
            word_start = true;
        }
    }
    out
}

/// One ranked detector output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Detection {
    /// Vocabulary label.
    pub label: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
}

/// General-purpose image labeller.
pub trait ObjectDetector: Send + Sync {
    /// Up to `top_k` detections sorted by descending confidence.
    fn detect(&self, image: &RgbImage, top_k: usize) -> ServingResult<Vec<Detection>>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Prototype {
    label: String,
    centroid: Vec<f32>,
}

/// Nearest-centroid detector over backbone features. Confidence is a softmax
/// over negative squared distances divided by `temperature`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrototypeDetector {
    input: Preprocessor,
    backbone: PooledColourBackbone,
    temperature: f32,
    prototypes: Vec<Prototype>,
}

impl PrototypeDetector {
    /// Default softmax temperature.
    pub const DEFAULT_TEMPERATURE: f32 = 1.0;

    /// Empty vocabulary.
    #[must_use]
    pub fn new(input: Preprocessor, temperature: f32) -> Self {
        Self {
            input,
            backbone: PooledColourBackbone::default(),
            temperature: if temperature > 0.0 {
                temperature
            } else {
                Self::DEFAULT_TEMPERATURE
            },
            prototypes: Vec::new(),
        }
    }

    /// Number of labels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.prototypes.len()
    }

    /// True with no labels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prototypes.is_empty()
    }

    /// Adds (or replaces) a label whose centroid is the mean feature vector of
    /// `examples`. Labels without examples are ignored.
    #[allow(clippy::cast_precision_loss)]
    pub fn add_label<'a>(
        &mut self,
        label: impl Into<String>,
        examples: impl IntoIterator<Item = &'a RgbImage>,
    ) {
        let mut sum = vec![0.0_f32; self.backbone.dim()];
        let mut count = 0_usize;
        for image in examples {
            let features = self.backbone.extract(&self.input.tensor_from_rgb(image));
            for (acc, value) in sum.iter_mut().zip(features.iter()) {
                *acc += value;
            }
            count += 1;
        }
        if count == 0 {
            return;
        }
        let centroid = sum.into_iter().map(|v| v / count as f32).collect();
        let label = label.into();
        self.prototypes.retain(|p| p.label != label);
        self.prototypes.push(Prototype { label, centroid });
    }

    /// Builds a vocabulary from `dir/<label>/*.{jpg,png}`. Unreadable images
    /// are skipped.
    pub fn from_directory(dir: &Path, input: Preprocessor, temperature: f32) -> ServingResult<Self> {
        let mut detector = Self::new(input, temperature);
        let mut label_dirs: Vec<_> = fs::read_dir(dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        label_dirs.sort();
        for label_dir in label_dirs {
            let Some(label) = label_dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let mut images = Vec::new();
            for entry in fs::read_dir(&label_dir)?.filter_map(Result::ok) {
                let path = entry.path();
                if !has_image_extension(&path) {
                    continue;
                }
                match image::open(&path) {
                    Ok(img) => images.push(img.to_rgb8()),
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "skipping unreadable detector example");
                    }
                }
            }
            detector.add_label(label.to_string(), &images);
        }
        if detector.is_empty() {
            return Err(ServingError::InvalidInput(format!(
                "no labelled example images under {}",
                dir.display()
            )));
        }
        Ok(detector)
    }

    /// Reads a vocabulary file.
    pub fn load(path: &Path) -> ServingResult<Self> {
        let detector: Self = serde_json::from_slice(&fs::read(path)?)?;
        if let Some(bad) = detector
            .prototypes
            .iter()
            .find(|p| p.centroid.len() != detector.backbone.dim())
        {
            return Err(ServingError::InvalidInput(format!(
                "detector label {} has {} features, expected {}",
                bad.label,
                bad.centroid.len(),
                detector.backbone.dim()
            )));
        }
        Ok(detector)
    }

    /// Writes the vocabulary atomically.
    pub fn save(&self, path: &Path) -> ServingResult<()> {
        let bytes = serde_json::to_vec(self)?;
        persist::write_atomic(path, &bytes)?;
        Ok(())
    }
}

impl ObjectDetector for PrototypeDetector {
    fn detect(&self, image: &RgbImage, top_k: usize) -> ServingResult<Vec<Detection>> {
        if self.prototypes.is_empty() {
            return Ok(Vec::new());
        }
        let features = self.backbone.extract(&self.input.tensor_from_rgb(image));
        let logits: Vec<f32> = self
            .prototypes
            .iter()
            .map(|p| {
                let distance: f32 = p
                    .centroid
                    .iter()
                    .zip(features.iter())
                    .map(|(c, f)| (c - f) * (c - f))
                    .sum();
                -distance / self.temperature
            })
            .collect();
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exp: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
        let total: f32 = exp.iter().sum();
        let mut detections: Vec<Detection> = self
            .prototypes
            .iter()
            .zip(exp)
            .map(|(p, e)| Detection {
                label: p.label.clone(),
                confidence: e / total,
            })
            .collect();
        detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        detections.truncate(top_k);
        Ok(detections)
    }
}

/// Gate policy knobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GatekeeperPolicy {
    /// Number of detections inspected for a cat/dog label.
    pub top_k: usize,
    /// Top confidence above which a non-cat/dog image is rejected.
    pub reject_threshold: f32,
    /// Also reject when nothing matched and the top confidence is low.
    pub reject_ambiguous: bool,
}

impl Default for GatekeeperPolicy {
    fn default() -> Self {
        Self {
            top_k: 5,
            reject_threshold: 0.3,
            reject_ambiguous: false,
        }
    }
}

/// Outcome of the gate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GatekeeperDecision {
    /// A cat/dog label appeared in the top detections.
    Accepted {
        /// First matching label.
        matched_label: String,
    },
    /// Confidently something else.
    Rejected {
        /// Display form of the top label.
        detected_object: String,
        /// Its confidence.
        confidence: f32,
    },
    /// No match, but the detector was unsure; the image is let through.
    Ambiguous {
        /// Top label.
        top_label: String,
        /// Its confidence.
        confidence: f32,
    },
    /// No detector configured or no detections produced.
    Skipped,
}

impl GatekeeperDecision {
    /// True if the domain classifier should run.
    #[must_use]
    pub const fn admits(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

/// Detector plus policy.
#[derive(Clone, Default)]
pub struct Gatekeeper {
    detector: Option<Arc<dyn ObjectDetector>>,
    policy: GatekeeperPolicy,
}

impl std::fmt::Debug for Gatekeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gatekeeper")
            .field("detector", &self.detector.is_some())
            .field("policy", &self.policy)
            .finish()
    }
}

impl Gatekeeper {
    /// Gate backed by `detector`.
    #[must_use]
    pub fn new(detector: Arc<dyn ObjectDetector>, policy: GatekeeperPolicy) -> Self {
        Self {
            detector: Some(detector),
            policy,
        }
    }

    /// Gate that admits everything.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// True when a detector is configured.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.detector.is_some()
    }

    /// Policy in force.
    #[must_use]
    pub const fn policy(&self) -> &GatekeeperPolicy {
        &self.policy
    }

    /// Runs the detector and applies the policy.
    pub fn inspect(&self, image: &RgbImage) -> ServingResult<GatekeeperDecision> {
        let Some(detector) = &self.detector else {
            return Ok(GatekeeperDecision::Skipped);
        };
        let detections = detector.detect(image, self.policy.top_k.max(1))?;
        Ok(self.decide(&detections))
    }

    /// Applies the policy to detections, ranking them by confidence first.
    #[must_use]
    pub fn decide(&self, detections: &[Detection]) -> GatekeeperDecision {
        let mut ranked: Vec<&Detection> = detections.iter().collect();
        ranked.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        ranked.truncate(self.policy.top_k.max(1));
        let Some(top) = ranked.first() else {
            return GatekeeperDecision::Skipped;
        };
        if let Some(hit) = ranked.iter().find(|d| is_cat_or_dog_label(&d.label)) {
            return GatekeeperDecision::Accepted {
                matched_label: hit.label.clone(),
            };
        }
        if top.confidence > self.policy.reject_threshold || self.policy.reject_ambiguous {
            tracing::info!(label = %top.label, confidence = top.confidence, "gatekeeper rejected image");
            return GatekeeperDecision::Rejected {
                detected_object: display_label(&top.label),
                confidence: top.confidence,
            };
        }
        GatekeeperDecision::Ambiguous {
            top_label: top.label.clone(),
            confidence: top.confidence,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Rgb;
    use tempfile::tempdir;

    pub(crate) struct FixedDetector(pub Vec<Detection>);

    impl ObjectDetector for FixedDetector {
        fn detect(&self, _image: &RgbImage, top_k: usize) -> ServingResult<Vec<Detection>> {
            Ok(self.0.iter().take(top_k).cloned().collect())
        }
    }

    pub(crate) fn det(label: &str, confidence: f32) -> Detection {
        Detection {
            label: label.into(),
            confidence,
        }
    }

    fn gate(detections: Vec<Detection>, policy: GatekeeperPolicy) -> Gatekeeper {
        Gatekeeper::new(Arc::new(FixedDetector(detections)), policy)
    }

    #[test]
    fn label_set_has_expected_size_and_membership() {
        assert_eq!(CAT_DOG_LABELS.len(), 63);
        assert!(is_cat_or_dog_label("Golden Retriever"));
        assert!(is_cat_or_dog_label("tabby"));
        assert!(!is_cat_or_dog_label("sports_car"));
    }

    #[test]
    fn display_label_title_cases_words() {
        assert_eq!(display_label("sports_car"), "Sports Car");
        assert_eq!(display_label("CRT_screen"), "Crt Screen");
        assert_eq!(display_label("jack-o'-lantern"), "Jack-O'-Lantern");
    }

    #[test]
    fn match_anywhere_in_top_five_accepts() {
        let g = gate(
            vec![
                det("sports_car", 0.9),
                det("wheel", 0.03),
                det("grille", 0.02),
                det("tabby", 0.01),
                det("lamp", 0.01),
            ],
            GatekeeperPolicy::default(),
        );
        let decision = g.inspect(&RgbImage::new(2, 2)).unwrap();
        assert_eq!(
            decision,
            GatekeeperDecision::Accepted {
                matched_label: "tabby".into()
            }
        );
        assert!(decision.admits());
    }

    #[test]
    fn match_below_top_k_is_ignored() {
        let policy = GatekeeperPolicy {
            top_k: 2,
            ..GatekeeperPolicy::default()
        };
        let decision = gate(vec![det("sports_car", 0.8), det("wheel", 0.1), det("pug", 0.05)], policy)
            .inspect(&RgbImage::new(2, 2))
            .unwrap();
        assert!(!decision.admits());
    }

    #[test]
    fn confident_non_match_rejects_with_display_label() {
        let decision = gate(vec![det("sports_car", 0.31)], GatekeeperPolicy::default())
            .decide(&[det("sports_car", 0.31)]);
        assert_eq!(
            decision,
            GatekeeperDecision::Rejected {
                detected_object: "Sports Car".into(),
                confidence: 0.31
            }
        );
    }

    #[test]
    fn unsorted_detections_name_the_most_confident_label() {
        let g = Gatekeeper::new(Arc::new(FixedDetector(Vec::new())), GatekeeperPolicy::default());
        let decision = g.decide(&[det("wheel", 0.1), det("sports_car", 0.7), det("lamp", 0.2)]);
        assert_eq!(
            decision,
            GatekeeperDecision::Rejected {
                detected_object: "Sports Car".into(),
                confidence: 0.7
            }
        );

        let narrow = Gatekeeper::new(
            Arc::new(FixedDetector(Vec::new())),
            GatekeeperPolicy {
                top_k: 1,
                ..GatekeeperPolicy::default()
            },
        );
        let decision = narrow.decide(&[det("lamp", 0.05), det("beagle", 0.6)]);
        assert_eq!(
            decision,
            GatekeeperDecision::Accepted {
                matched_label: "beagle".into()
            }
        );
    }

    #[test]
    fn threshold_is_strict_and_low_confidence_passes() {
        let g = Gatekeeper::new(Arc::new(FixedDetector(Vec::new())), GatekeeperPolicy::default());
        let decision = g.decide(&[det("sports_car", 0.3), det("wheel", 0.2)]);
        assert!(matches!(decision, GatekeeperDecision::Ambiguous { .. }));
        assert!(decision.admits());

        let strict = Gatekeeper::new(
            Arc::new(FixedDetector(Vec::new())),
            GatekeeperPolicy {
                reject_ambiguous: true,
                ..GatekeeperPolicy::default()
            },
        );
        assert!(!strict.decide(&[det("sports_car", 0.3)]).admits());
    }

    #[test]
    fn missing_detector_or_detections_skip() {
        let image = RgbImage::new(1, 1);
        assert_eq!(
            Gatekeeper::disabled().inspect(&image).unwrap(),
            GatekeeperDecision::Skipped
        );
        assert_eq!(
            gate(Vec::new(), GatekeeperPolicy::default())
                .inspect(&image)
                .unwrap(),
            GatekeeperDecision::Skipped
        );
    }

    #[test]
    fn prototype_detector_ranks_nearest_label_first() {
        let input = Preprocessor::square(8);
        let red = RgbImage::from_pixel(8, 8, Rgb([230, 20, 20]));
        let green = RgbImage::from_pixel(8, 8, Rgb([20, 230, 20]));
        let mut detector = PrototypeDetector::new(input, 1.0);
        detector.add_label("tabby", [&red]);
        detector.add_label("golf_ball", [&green]);
        assert_eq!(detector.len(), 2);

        let detections = detector.detect(&red, 5).unwrap();
        assert_eq!(detections[0].label, "tabby");
        let total: f32 = detections.iter().map(|d| d.confidence).sum();
        assert!((total - 1.0).abs() < 1e-4);
        assert!(detections[0].confidence > detections[1].confidence);
        assert_eq!(detector.detect(&green, 1).unwrap().len(), 1);
    }

    #[test]
    fn prototype_detector_persists_and_builds_from_directory() {
        let tmp = tempdir().unwrap();
        for (label, rgb) in [("tabby", [200, 120, 40]), ("sports_car", [10, 10, 220])] {
            let dir = tmp.path().join("vocab").join(label);
            fs::create_dir_all(&dir).unwrap();
            RgbImage::from_pixel(6, 6, Rgb(rgb))
                .save(dir.join("example.png"))
                .unwrap();
        }
        let detector =
            PrototypeDetector::from_directory(&tmp.path().join("vocab"), Preprocessor::square(8), 1.0)
                .unwrap();
        assert_eq!(detector.len(), 2);
        let path = tmp.path().join("detector.json");
        detector.save(&path).unwrap();
        let loaded = PrototypeDetector::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        let sample = RgbImage::from_pixel(6, 6, Rgb([200, 120, 40]));
        assert_eq!(loaded.detect(&sample, 1).unwrap()[0].label, "tabby");
    }

    #[test]
    fn empty_vocabulary_directory_is_rejected() {
        let tmp = tempdir().unwrap();
        assert!(PrototypeDetector::from_directory(tmp.path(), Preprocessor::square(8), 1.0).is_err());
    }
}
