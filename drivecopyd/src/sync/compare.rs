use drivecopy_core::RemoteFile;

/// How a destination file relates to its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Matched,
    Mismatched,
    Missing,
}

/// Same size, and either equal content hashes or no hash on either side.
pub fn is_already_mirrored(src: &RemoteFile, dst: &RemoteFile) -> bool {
    if src.size != dst.size {
        return false;
    }
    match (&src.hash, &dst.hash) {
        (Some(left), Some(right)) => left == right,
        (None, None) => true,
        _ => false,
    }
}

pub fn compare(src: &RemoteFile, dst: Option<&RemoteFile>) -> Comparison {
    match dst {
        None => Comparison::Missing,
        Some(dst) if is_already_mirrored(src, dst) => Comparison::Matched,
        Some(_) => Comparison::Mismatched,
    }
}
