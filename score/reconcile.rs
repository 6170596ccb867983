// ========================================================================================
//
//                     CHROMOSOME NAMING & ALLELE ORIENTATION
//
// ========================================================================================
//
// Score files and genotype stores disagree about chromosome names ("chr7", "7",
// "07") and about which allele of a pair is listed first. Everything here is a
// pure function so the locator and the scorer share one set of rules.

const CHR_PREFIX: &str = "chr";

/// Whether one side of the join names its chromosomes with a `chr` prefix.
/// Detected once per side from the first chromosome seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChromosomeConvention {
    Prefixed,
    Bare,
}

impl ChromosomeConvention {
    pub fn detect(first_chromosome: &str) -> Self {
        if first_chromosome.starts_with(CHR_PREFIX) {
            ChromosomeConvention::Prefixed
        } else {
            ChromosomeConvention::Bare
        }
    }
}

/// Removes zero padding from the numeric part of a chromosome name while keeping
/// any `chr` prefix: "07" → "7", "chr07" → "chr7". Names that are not numbers
/// ("X", "MT", "chrY") are returned unchanged.
pub fn strip_leading_zeros(chromosome: &str) -> String {
    let (prefix, body) = match chromosome.strip_prefix(CHR_PREFIX) {
        Some(rest) => (CHR_PREFIX, rest),
        None => ("", chromosome),
    };
    match body.parse::<u32>() {
        Ok(n) if !body.starts_with('+') => format!("{prefix}{n}"),
        _ => chromosome.to_string(),
    }
}

/// Renames a chromosome into `target`'s prefix convention and strips zero padding.
pub fn conform_chromosome(chromosome: &str, target: ChromosomeConvention) -> String {
    let renamed = match (target, chromosome.strip_prefix(CHR_PREFIX)) {
        (ChromosomeConvention::Bare, Some(rest)) => rest.to_string(),
        (ChromosomeConvention::Prefixed, None) => format!("{CHR_PREFIX}{chromosome}"),
        _ => chromosome.to_string(),
    };
    strip_leading_zeros(&renamed)
}

/// The forms of a chromosome name worth trying in a lookup, most literal first.
pub fn lookup_forms(chromosome: &str) -> impl Iterator<Item = String> {
    let original = chromosome.to_string();
    let stripped = strip_leading_zeros(chromosome);
    let second = (stripped != original).then_some(stripped);
    std::iter::once(original).chain(second)
}

/// Zero-pads a bare autosome to two digits ("7" → "07"), as some imputed data
/// releases name their chromosomes in the index. Anything else is unchanged.
pub fn zero_padded(chromosome: &str) -> String {
    match chromosome.parse::<u32>() {
        Ok(n) if n < 10 && !chromosome.starts_with('+') => format!("{n:02}"),
        _ => chromosome.to_string(),
    }
}

/// How a score record lines up with a site's allele list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Orientation {
    /// Index of the effect allele among the site's alleles.
    pub effect_index: usize,
    /// Index of the other score allele among the site's alleles.
    pub other_index: usize,
}

/// Whether a biallelic site carries the same pair of alleles as the score record,
/// in either order, ignoring case. No strand flipping is attempted.
pub fn alleles_match(prs_allele1: &str, prs_allele2: &str, site_allele1: &str, site_allele2: &str) -> bool {
    (prs_allele1.eq_ignore_ascii_case(site_allele1) && prs_allele2.eq_ignore_ascii_case(site_allele2))
        || (prs_allele1.eq_ignore_ascii_case(site_allele2)
            && prs_allele2.eq_ignore_ascii_case(site_allele1))
}

/// Finds the score record's alleles among a site's alleles (reference first).
/// Returns `None` when either score allele is absent from the site.
pub fn orient(
    effect_allele: &str,
    other_allele: &str,
    site_alleles: &[impl AsRef<str>],
) -> Option<Orientation> {
    let find = |wanted: &str| {
        site_alleles
            .iter()
            .position(|a| a.as_ref().eq_ignore_ascii_case(wanted))
    };
    let effect_index = find(effect_allele)?;
    let other_index = find(other_allele)?;
    if effect_index == other_index {
        return None;
    }
    Some(Orientation {
        effect_index,
        other_index,
    })
}
