use std::ffi::OsString;
use std::path::{Path, PathBuf};

const DESCRIPTOR_SUFFIX: &str = ".xml";

fn with_descriptor_suffix(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(DESCRIPTOR_SUFFIX);
    PathBuf::from(name)
}

/// Paths searched for a local location, in priority order.
///
/// Absolute locations are only tried as given; relative ones are tried under
/// the server applications directory first, then the shared one. Each base is
/// tried bare and with the descriptor suffix.
pub fn candidate_paths(location: &str, apps_dir: &Path, shared_apps_dir: &Path) -> Vec<PathBuf> {
    let location = Path::new(location);
    let bases = if location.is_absolute() {
        vec![location.to_path_buf()]
    } else {
        vec![apps_dir.join(location), shared_apps_dir.join(location)]
    };

    bases
        .into_iter()
        .flat_map(|base| {
            let descriptor = with_descriptor_suffix(&base);
            [base, descriptor]
        })
        .collect()
}

/// First candidate that exists
pub fn find_existing(candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates.iter().find(|path| path.exists()).cloned()
}
