use std::error::Error;
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use anyhow::bail;
use log::info;

use crate::tree::{tree_parser, Tree};
use crate::Result;

pub(crate) struct DataError {
    pub(crate) message: String,
}
impl fmt::Debug for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}
impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}
impl Error for DataError {}

/// Reads newick trees from a file, returning a vector of trees.
/// Only rooted binary trees are accepted.
///
/// # Arguments
/// * `path` - Path to the newick file.
pub fn read_newick_from_file(path: &Path) -> Result<Vec<Tree>> {
    info!("Reading newick trees from file {}", path.display());
    let newick = fs::read_to_string(path)?;
    info!("Read file successfully");
    let trees = tree_parser::from_newick(&newick)?;
    if trees.is_empty() {
        bail!(DataError {
            message: format!("No trees found in file {}", path.display())
        });
    }
    Ok(trees)
}

/// Writes newick trees to the given file path, one per line. Will return an
/// error if the file already exists.
///
/// # Arguments
/// * `trees` - Vector of newick trees.
/// * `path` - Path to the newick file.
///
/// # Example
/// ```
/// # use std::fs::read_to_string;
/// use species_dating::tree::tree_parser::from_newick;
/// use species_dating::io::write_newick_to_file;
///
/// let dir = tempfile::tempdir().unwrap();
/// let output_path = dir.path().join("trees.newick");
/// let trees = from_newick("((A:1,B:2):1,(D:1,E:2):1);").unwrap();
/// write_newick_to_file(&trees, &output_path).unwrap();
/// # assert_eq!(read_to_string(&output_path).unwrap().trim(), "((A:1,B:2):1,(D:1,E:2):1);");
/// assert!(write_newick_to_file(&trees, &output_path).is_err());
/// ```
pub fn write_newick_to_file(trees: &[Tree], path: &Path) -> Result<()> {
    info!("Writing newick trees to file {}", path.display());
    if path.exists() {
        bail!(DataError {
            message: String::from("File already exists")
        });
    }
    let mut writer = File::create(path)?;
    for tree in trees {
        writer.write_all(tree.to_newick().as_bytes())?;
        writer.write_all(b"\n")?;
    }
    info!("Finished writing successfully");
    Ok(())
}

/// Writes a single newick string to `path`, truncating the file if it
/// exists. Used for checkpoints that are rewritten during a search.
pub(crate) fn save_newick_to_file(newick: &str, path: &Path) -> Result<()> {
    info!("Saving newick tree to file {}", path.display());
    let mut writer = File::create(path)?;
    writer.write_all(newick.as_bytes())?;
    writer.write_all(b"\n")?;
    Ok(())
}
