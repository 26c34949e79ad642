use image::{DynamicImage, GrayImage};
use image_hasher::{HashAlg, Hasher, HasherConfig};

/// 64-bit DCT perceptual hash over an 8x8 low-frequency block.
pub struct PerceptualHasher {
    hasher: Hasher,
}

impl PerceptualHasher {
    pub fn new() -> Self {
        let hasher = HasherConfig::new()
            .hash_alg(HashAlg::Mean)
            .preproc_dct()
            .hash_size(8, 8)
            .to_hasher();
        Self { hasher }
    }

    pub fn hash(&self, luma: &GrayImage) -> u64 {
        let img = DynamicImage::ImageLuma8(luma.clone());
        let hash = self.hasher.hash_image(&img);
        fold_to_u64(hash.as_bytes())
    }
}

impl Default for PerceptualHasher {
    fn default() -> Self {
        Self::new()
    }
}

fn fold_to_u64(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(8)
        .fold(0u64, |acc, &byte| (acc << 8) | u64::from(byte))
}

pub fn hamming_distance(lhs: u64, rhs: u64) -> u32 {
    (lhs ^ rhs).count_ones()
}
