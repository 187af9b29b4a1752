use flate2::read::GzDecoder;
use image::{GrayImage, ImageReader, Luma, Rgb, RgbImage};
use ndarray::{s, Array2, Array4, ArrayView2, ArrayView3, ArrayView4, Axis};
use rand::seq::SliceRandom;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

use crate::error::{dataset, CapsError, Result};

const IDX_IMAGES_MAGIC: u32 = 0x0000_0803;
const IDX_LABELS_MAGIC: u32 = 0x0000_0801;

/// Jeux de données reconnus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    Mnist,
    FashionMnist,
    /// Un sous-répertoire par classe, sous `train/` et `test/`
    ImageFolder,
}

impl FromStr for DatasetKind {
    type Err = CapsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mnist" => Ok(DatasetKind::Mnist),
            "fashion-mnist" | "fashion_mnist" => Ok(DatasetKind::FashionMnist),
            "folder" | "image-folder" => Ok(DatasetKind::ImageFolder),
            other => Err(dataset(format!(
                "jeu de données inconnu '{other}' (attendu: mnist, fashion-mnist, folder)"
            ))),
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DatasetKind::Mnist => "mnist",
            DatasetKind::FashionMnist => "fashion-mnist",
            DatasetKind::ImageFolder => "folder",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl FromStr for Split {
    type Err = CapsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "train" => Ok(Split::Train),
            "test" => Ok(Split::Test),
            other => Err(dataset(format!("mode inconnu '{other}' (attendu: train, test)"))),
        }
    }
}

/// Images NCHW dans [0, 1] et étiquettes one-hot
#[derive(Debug, Clone)]
pub struct Dataset {
    pub images: Array4<f32>,
    pub labels: Array2<f32>,
}

/// Données chargées selon le mode
#[derive(Debug, Clone)]
pub enum LoadedData {
    Train { train: Dataset, validation: Dataset },
    Test(Dataset),
}

impl Dataset {
    pub fn new(images: Array4<f32>, labels: Array2<f32>) -> Result<Self> {
        if images.dim().0 != labels.nrows() {
            return Err(dataset(format!(
                "{} images pour {} étiquettes",
                images.dim().0,
                labels.nrows()
            )));
        }
        Ok(Self { images, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Échantillons [start, end), bornés à la taille du jeu
    pub fn batch(&self, start: usize, end: usize) -> (ArrayView4<'_, f32>, ArrayView2<'_, f32>) {
        let end = end.min(self.len());
        let start = start.min(end);
        (
            self.images.slice(s![start..end, .., .., ..]),
            self.labels.slice(s![start..end, ..]),
        )
    }

    /// Itère sur des batchs consécutifs; le dernier peut être incomplet
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = (ArrayView4<'_, f32>, ArrayView2<'_, f32>)> {
        let batch_size = batch_size.max(1);
        (0..self.len())
            .step_by(batch_size)
            .map(move |start| self.batch(start, start + batch_size))
    }

    /// Copie mélangée, images et étiquettes permutées ensemble
    pub fn randomize<R: Rng + ?Sized>(&self, rng: &mut R) -> Dataset {
        let mut permutation: Vec<usize> = (0..self.len()).collect();
        permutation.shuffle(rng);
        Dataset {
            images: self.images.select(Axis(0), &permutation),
            labels: self.labels.select(Axis(0), &permutation),
        }
    }

    /// Sépare les `count` premiers échantillons du reste
    pub fn split_at(&self, count: usize) -> (Dataset, Dataset) {
        let (head_images, head_labels) = self.batch(0, count);
        let (tail_images, tail_labels) = self.batch(count, self.len());
        (
            Dataset {
                images: head_images.to_owned(),
                labels: head_labels.to_owned(),
            },
            Dataset {
                images: tail_images.to_owned(),
                labels: tail_labels.to_owned(),
            },
        )
    }

    /// Tronque le jeu à `max_samples` échantillons
    pub fn truncate(self, max_samples: usize) -> Dataset {
        if max_samples >= self.len() {
            return self;
        }
        self.split_at(max_samples).0
    }
}

/// Chargeur de jeux de données
pub struct DataLoader {
    root: PathBuf,
    kind: DatasetKind,
    /// (canaux, hauteur, largeur) attendus par le réseau
    input_shape: (usize, usize, usize),
    num_classes: usize,
    validation_size: usize,
    seed: u64,
}

impl DataLoader {
    pub fn new(
        root: impl Into<PathBuf>,
        kind: DatasetKind,
        input_shape: (usize, usize, usize),
        num_classes: usize,
    ) -> Self {
        Self {
            root: root.into(),
            kind,
            input_shape,
            num_classes,
            validation_size: 5000,
            seed: 42,
        }
    }

    pub fn with_validation_size(mut self, validation_size: usize) -> Self {
        self.validation_size = validation_size;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Train: jeu d'entraînement et de validation (les `validation_size`
    /// premiers échantillons); Test: jeu de test
    pub fn load(&self, split: Split) -> Result<LoadedData> {
        log::info!("📁 Chargement de {} ({:?}) depuis {}", self.kind, split, self.root.display());
        let start = Instant::now();

        let data = match self.kind {
            DatasetKind::Mnist | DatasetKind::FashionMnist => self.load_idx(split)?,
            DatasetKind::ImageFolder => self.load_folder(split)?,
        };
        if data.is_empty() {
            return Err(dataset(format!("aucun échantillon dans {}", self.root.display())));
        }

        let loaded = match split {
            Split::Train => {
                if self.validation_size >= data.len() {
                    return Err(dataset(format!(
                        "validation_size ({}) >= nombre d'échantillons ({})",
                        self.validation_size,
                        data.len()
                    )));
                }
                let (validation, train) = data.split_at(self.validation_size);
                log::info!("🎯 Split: train={}, validation={}", train.len(), validation.len());
                LoadedData::Train { train, validation }
            }
            Split::Test => {
                log::info!("🎯 Test: {} échantillons", data.len());
                LoadedData::Test(data)
            }
        };

        log::info!("⏱️  Chargé en {:?}", start.elapsed());
        Ok(loaded)
    }

    fn load_idx(&self, split: Split) -> Result<Dataset> {
        let prefix = match split {
            Split::Train => "train",
            Split::Test => "t10k",
        };
        let images = read_idx_file(&self.root, &format!("{prefix}-images-idx3-ubyte"))?;
        let labels = read_idx_file(&self.root, &format!("{prefix}-labels-idx1-ubyte"))?;

        let images = parse_idx_images(&images)?;
        let labels = parse_idx_labels(&labels, self.num_classes)?;

        let (channels, height, width) = self.input_shape;
        if (channels, height, width) != (1, images.dim().2, images.dim().3) {
            return Err(dataset(format!(
                "images IDX {}x{} incompatibles avec l'entrée {:?}",
                images.dim().2,
                images.dim().3,
                self.input_shape
            )));
        }
        Dataset::new(images, labels)
    }

    fn load_folder(&self, split: Split) -> Result<Dataset> {
        let dir = self.root.join(match split {
            Split::Train => "train",
            Split::Test => "test",
        });

        let mut class_dirs: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_dir())
            .collect();
        class_dirs.sort();

        if class_dirs.len() != self.num_classes {
            return Err(dataset(format!(
                "{} classes trouvées dans {}, {} attendues",
                class_dirs.len(),
                dir.display(),
                self.num_classes
            )));
        }

        let mut samples = Vec::new();
        for (class, class_dir) in class_dirs.iter().enumerate() {
            let mut files: Vec<PathBuf> = fs::read_dir(class_dir)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| is_image(path))
                .collect();
            files.sort();
            log::debug!("   {}: {} images", class_dir.display(), files.len());
            for file in files {
                samples.push((file, class));
            }
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        samples.shuffle(&mut rng);

        let (channels, height, width) = self.input_shape;
        let mut images = Array4::zeros((samples.len(), channels, height, width));
        let mut labels = Array2::zeros((samples.len(), self.num_classes));
        for (i, (path, class)) in samples.iter().enumerate() {
            if i % 500 == 0 && i > 0 {
                log::debug!("     📸 {i} images chargées...");
            }
            self.load_image(path, images.slice_mut(s![i, .., .., ..]))?;
            labels[[i, *class]] = 1.0;
        }

        Dataset::new(images, labels)
    }

    fn load_image(&self, path: &Path, mut target: ndarray::ArrayViewMut3<f32>) -> Result<()> {
        let (channels, height, width) = self.input_shape;
        let img = ImageReader::open(path)?.decode()?;
        let resized = img.resize_exact(width as u32, height as u32, image::imageops::FilterType::Triangle);

        match channels {
            1 => {
                let gray = resized.to_luma32f();
                for (x, y, pixel) in gray.enumerate_pixels() {
                    target[[0, y as usize, x as usize]] = pixel.0[0];
                }
            }
            3 => {
                let rgb = resized.to_rgb32f();
                for (x, y, pixel) in rgb.enumerate_pixels() {
                    for c in 0..3 {
                        target[[c, y as usize, x as usize]] = pixel.0[c];
                    }
                }
            }
            other => {
                return Err(dataset(format!("{other} canaux non supportés pour les images")));
            }
        }
        Ok(())
    }
}

/// Écrit une image [C, H, W] dans [0, 1] en PNG (1 ou 3 canaux)
pub fn save_image(image: &ArrayView3<f32>, path: &Path) -> Result<()> {
    let (channels, height, width) = image.dim();
    let to_byte = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;

    match channels {
        1 => GrayImage::from_fn(width as u32, height as u32, |x, y| {
            Luma([to_byte(image[[0, y as usize, x as usize]])])
        })
        .save(path)?,
        3 => RgbImage::from_fn(width as u32, height as u32, |x, y| {
            let (x, y) = (x as usize, y as usize);
            Rgb([
                to_byte(image[[0, y, x]]),
                to_byte(image[[1, y, x]]),
                to_byte(image[[2, y, x]]),
            ])
        })
        .save(path)?,
        other => {
            return Err(dataset(format!("{other} canaux non supportés pour les images")));
        }
    }
    Ok(())
}

fn is_image(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref(),
        Some("png" | "jpg" | "jpeg" | "bmp")
    )
}

/// Lit `name` ou `name.gz` dans `dir`
fn read_idx_file(dir: &Path, name: &str) -> Result<Vec<u8>> {
    let plain = dir.join(name);
    let mut bytes = Vec::new();
    if plain.exists() {
        File::open(&plain)?.read_to_end(&mut bytes)?;
        return Ok(bytes);
    }
    let gz = dir.join(format!("{name}.gz"));
    if gz.exists() {
        GzDecoder::new(File::open(&gz)?).read_to_end(&mut bytes)?;
        return Ok(bytes);
    }
    Err(dataset(format!("fichier IDX introuvable: {}", plain.display())))
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    bytes
        .get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or_else(|| dataset("en-tête IDX tronqué"))
}

/// Images IDX (magic 0x803) -> [N, 1, lignes, colonnes], pixels / 255
pub fn parse_idx_images(bytes: &[u8]) -> Result<Array4<f32>> {
    let magic = read_u32(bytes, 0)?;
    if magic != IDX_IMAGES_MAGIC {
        return Err(dataset(format!("magic IDX d'images invalide: {magic:#010x}")));
    }
    let count = read_u32(bytes, 4)? as usize;
    let rows = read_u32(bytes, 8)? as usize;
    let cols = read_u32(bytes, 12)? as usize;

    let end = count
        .checked_mul(rows)
        .and_then(|n| n.checked_mul(cols))
        .and_then(|n| n.checked_add(16))
        .ok_or_else(|| dataset("en-tête IDX invalide"))?;
    let pixels = bytes
        .get(16..end)
        .ok_or_else(|| dataset("données IDX d'images tronquées"))?;
    let data: Vec<f32> = pixels.iter().map(|&p| p as f32 / 255.0).collect();
    Ok(Array4::from_shape_vec((count, 1, rows, cols), data)?)
}

/// Étiquettes IDX (magic 0x801) -> one-hot [N, num_classes]
pub fn parse_idx_labels(bytes: &[u8], num_classes: usize) -> Result<Array2<f32>> {
    let magic = read_u32(bytes, 0)?;
    if magic != IDX_LABELS_MAGIC {
        return Err(dataset(format!("magic IDX d'étiquettes invalide: {magic:#010x}")));
    }
    let count = read_u32(bytes, 4)? as usize;
    let end = count
        .checked_add(8)
        .ok_or_else(|| dataset("en-tête IDX invalide"))?;
    let raw = bytes
        .get(8..end)
        .ok_or_else(|| dataset("données IDX d'étiquettes tronquées"))?;

    let mut labels = Array2::zeros((count, num_classes));
    for (i, &label) in raw.iter().enumerate() {
        let class = label as usize;
        if class >= num_classes {
            return Err(dataset(format!("étiquette {class} hors de [0, {num_classes})")));
        }
        labels[[i, class]] = 1.0;
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx_images(count: u32, rows: u32, cols: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        for v in [IDX_IMAGES_MAGIC, count, rows, cols] {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        bytes.extend((0..count * rows * cols).map(|i| (i % 256) as u8));
        bytes
    }

    fn idx_labels(labels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&IDX_LABELS_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&(labels.len() as u32).to_be_bytes());
        bytes.extend_from_slice(labels);
        bytes
    }

    fn toy_dataset(n: usize) -> Dataset {
        let images = Array4::from_shape_fn((n, 1, 2, 2), |(i, _, _, _)| i as f32);
        let labels = Array2::from_shape_fn((n, 3), |(i, c)| if i % 3 == c { 1.0 } else { 0.0 });
        Dataset::new(images, labels).unwrap()
    }

    #[test]
    fn test_unknown_dataset_rejected() {
        assert!(matches!("cifar".parse::<DatasetKind>(), Err(CapsError::Dataset(_))));
        assert_eq!("fashion-mnist".parse::<DatasetKind>().unwrap(), DatasetKind::FashionMnist);
        assert!("validation".parse::<Split>().is_err());
    }

    #[test]
    fn test_parse_idx_images() {
        let images = parse_idx_images(&idx_images(2, 3, 4)).unwrap();
        assert_eq!(images.dim(), (2, 1, 3, 4));
        assert_eq!(images[[1, 0, 0, 0]], 12.0 / 255.0);
    }

    #[test]
    fn test_parse_idx_rejects_bad_magic_and_truncation() {
        let mut bytes = idx_images(2, 3, 4);
        assert!(parse_idx_images(&bytes[..20]).is_err());
        bytes[3] = 0x01;
        assert!(parse_idx_images(&bytes).is_err());
    }

    #[test]
    fn test_parse_idx_rejects_overflowing_header() {
        let mut images = Vec::new();
        for v in [IDX_IMAGES_MAGIC, u32::MAX, u32::MAX, u32::MAX] {
            images.extend_from_slice(&v.to_be_bytes());
        }
        assert!(matches!(parse_idx_images(&images), Err(CapsError::Dataset(_))));

        let mut labels = Vec::new();
        for v in [IDX_LABELS_MAGIC, u32::MAX] {
            labels.extend_from_slice(&v.to_be_bytes());
        }
        assert!(matches!(parse_idx_labels(&labels, 10), Err(CapsError::Dataset(_))));
    }

    #[test]
    fn test_parse_idx_labels_one_hot() {
        let labels = parse_idx_labels(&idx_labels(&[3, 0, 9]), 10).unwrap();
        assert_eq!(labels.dim(), (3, 10));
        assert_eq!(labels[[0, 3]], 1.0);
        assert_eq!(labels.row(2).sum(), 1.0);
        assert!(parse_idx_labels(&idx_labels(&[10]), 10).is_err());
    }

    #[test]
    fn test_batches_cover_dataset() {
        let data = toy_dataset(7);
        let sizes: Vec<usize> = data.batches(3).map(|(images, _)| images.dim().0).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[test]
    fn test_randomize_keeps_pairs() {
        let data = toy_dataset(9);
        let mut rng = StdRng::seed_from_u64(1);
        let shuffled = data.randomize(&mut rng);

        assert_eq!(shuffled.len(), 9);
        for i in 0..9 {
            let original = shuffled.images[[i, 0, 0, 0]] as usize;
            assert_eq!(shuffled.labels.row(i), data.labels.row(original));
        }
    }

    #[test]
    fn test_split_and_truncate() {
        let data = toy_dataset(10);
        let (head, tail) = data.split_at(4);
        assert_eq!((head.len(), tail.len()), (4, 6));
        assert_eq!(tail.images[[0, 0, 0, 0]], 4.0);
        assert_eq!(data.truncate(3).len(), 3);
    }

    #[test]
    fn test_load_idx_from_directory() {
        let dir = std::env::temp_dir().join(format!("capsnet-idx-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("t10k-images-idx3-ubyte"), idx_images(4, 28, 28)).unwrap();
        fs::write(dir.join("t10k-labels-idx1-ubyte"), idx_labels(&[1, 2, 3, 4])).unwrap();

        let loader = DataLoader::new(&dir, DatasetKind::Mnist, (1, 28, 28), 10);
        match loader.load(Split::Test).unwrap() {
            LoadedData::Test(test) => {
                assert_eq!(test.len(), 4);
                assert_eq!(test.labels[[3, 4]], 1.0);
            }
            LoadedData::Train { .. } => panic!("jeu de test attendu"),
        }

        assert!(loader.load(Split::Train).is_err());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_gzipped_idx() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let dir = std::env::temp_dir().join(format!("capsnet-idx-gz-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        for (name, bytes) in [
            ("train-images-idx3-ubyte.gz", idx_images(6, 28, 28)),
            ("train-labels-idx1-ubyte.gz", idx_labels(&[0, 1, 2, 3, 4, 5])),
        ] {
            let mut encoder = GzEncoder::new(File::create(dir.join(name)).unwrap(), Compression::default());
            encoder.write_all(&bytes).unwrap();
            encoder.finish().unwrap();
        }

        let loader = DataLoader::new(&dir, DatasetKind::FashionMnist, (1, 28, 28), 10).with_validation_size(2);
        match loader.load(Split::Train).unwrap() {
            LoadedData::Train { train, validation } => {
                assert_eq!((train.len(), validation.len()), (4, 2));
                // Les premiers échantillons forment la validation
                assert_eq!(validation.labels[[1, 1]], 1.0);
                assert_eq!(train.labels[[0, 2]], 1.0);
                assert_eq!(train.images[[0, 0, 0, 0]], (2 * 28 * 28 % 256) as f32 / 255.0);
            }
            LoadedData::Test(_) => panic!("jeu d'entraînement attendu"),
        }
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_image_folder() {
        let dir = std::env::temp_dir().join(format!("capsnet-folder-{}", std::process::id()));
        for (class, value) in [("a_dark", 0.0_f32), ("b_bright", 1.0)] {
            let class_dir = dir.join("test").join(class);
            fs::create_dir_all(&class_dir).unwrap();
            for i in 0..2 {
                let image = ndarray::Array3::from_elem((1, 6, 6), value);
                save_image(&image.view(), &class_dir.join(format!("{i}.png"))).unwrap();
            }
        }

        let loader = DataLoader::new(&dir, DatasetKind::ImageFolder, (1, 4, 4), 2);
        match loader.load(Split::Test).unwrap() {
            LoadedData::Test(test) => {
                assert_eq!(test.images.dim(), (4, 1, 4, 4));
                for i in 0..test.len() {
                    // Classe 0 sombre, classe 1 claire (noms triés)
                    let expected = if test.labels[[i, 1]] == 1.0 { 1.0 } else { 0.0 };
                    assert!(test.images.slice(s![i, .., .., ..]).iter().all(|&p| (p - expected).abs() < 1e-3));
                }
                assert_eq!(test.labels.sum_axis(Axis(0)).to_vec(), vec![2.0, 2.0]);
            }
            LoadedData::Train { .. } => panic!("jeu de test attendu"),
        }

        let wrong_classes = DataLoader::new(&dir, DatasetKind::ImageFolder, (1, 4, 4), 3);
        assert!(matches!(wrong_classes.load(Split::Test), Err(CapsError::Dataset(_))));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_save_image_rejects_unsupported_channels() {
        let image = ndarray::Array3::<f32>::zeros((2, 3, 3));
        let path = std::env::temp_dir().join("capsnet-two-channels.png");
        assert!(save_image(&image.view(), &path).is_err());
    }
}
