//! Deployment configuration.
//!
//! One TOML document describes both engines: the member devices and stripe
//! geometry of the raid group, and the backing LUN and capacity profile of
//! the persistence store. Sizes in the document are human-readable
//! (`"64 MiB"`); they are parsed with `unbytify`.
//!
//! ```toml
//! [array]
//! members = ["/dev/sdb", "/dev/sdc", "/dev/sdd", "/dev/sde"]
//! parity_positions = [3]
//! element_size = 16
//!
//! [persist]
//! lun = "/var/lib/stripe/persist.img"
//! profile = "Production"
//! ```

use crate::persist::CapacityProfile;
use crate::raid::RaidGeometry;
use crate::vdev::{Block, File, Vdev};
use libc;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

error_chain! {
    foreign_links {
        Io(io::Error);
        TomlDe(toml::de::Error);
        TomlSer(toml::ser::Error);
    }
    errors {
        /// A size string `unbytify` cannot parse.
        InvalidSize(size: String) {
            display("unparsable size {:?}", size)
        }
        /// The document fails a structural check before any device is
        /// opened.
        InvalidConfiguration(msg: String) {
            display("invalid configuration: {}", msg)
        }
    }
}

/// The raid-group section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrayConfiguration {
    /// Member devices in position order.
    pub members: Vec<PathBuf>,
    /// Positions that carry parity, one for single and two for dual parity.
    pub parity_positions: Vec<u32>,
    /// Blocks per stripe element.
    pub element_size: u32,
    /// Physical write granularity in blocks, when the members require one.
    #[serde(default)]
    pub alignment: Option<u32>,
}

/// The persistence-store section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistConfiguration {
    /// Backing file or block device of the store.
    pub lun: PathBuf,
    /// Entry-count budgets to lay the store out with.
    pub profile: CapacityProfile,
    /// Size to create `lun` with when it does not exist yet, e.g.
    /// `"16 MiB"`. An existing LUN is never resized.
    #[serde(default)]
    pub size: Option<String>,
}

/// The parsed deployment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    /// Raid group description.
    pub array: ArrayConfiguration,
    /// Persistence store description.
    pub persist: PersistConfiguration,
}

impl Configuration {
    /// Parses a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Configuration = toml::from_str(s)?;
        if config.array.members.len() < 2 {
            bail!(ErrorKind::InvalidConfiguration(
                "an array needs at least two members".into()
            ));
        }
        if let Some(size) = &config.persist.size {
            parse_size(size)?;
        }
        Ok(config)
    }

    /// Serializes the configuration back into TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }

    /// Opens every member device in position order.
    pub fn open_members(&self) -> Result<Vec<File>> {
        self.array
            .members
            .iter()
            .map(|path| open_device(path))
            .collect()
    }

    /// Builds the stripe geometry from opened members. The drive capacity
    /// is the smallest member size.
    pub fn build_geometry(&self, members: &[File]) -> Result<RaidGeometry> {
        let capacity = members
            .iter()
            .map(Vdev::size)
            .min()
            .ok_or_else(|| ErrorKind::InvalidConfiguration("no members opened".into()))?;
        RaidGeometry::new(
            members.len() as u32,
            &self.array.parity_positions,
            Block(self.array.element_size),
            capacity,
            self.array.alignment,
        )
        .map_err(|e| {
            ErrorKind::InvalidConfiguration(e.to_string()).into()
        })
    }

    /// Opens the persistence LUN, creating and sizing it first when it does
    /// not exist and a creation size is configured.
    pub fn open_lun(&self) -> Result<File> {
        if !self.persist.lun.exists() {
            if let Some(size) = &self.persist.size {
                let bytes = parse_size(size)?;
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(&self.persist.lun)?;
                file.set_len(bytes)?;
            }
        }
        open_device(&self.persist.lun)
    }
}

fn parse_size(s: &str) -> Result<u64> {
    unbytify::unbytify(s).map_err(|_| ErrorKind::InvalidSize(s.to_string()).into())
}

fn open_device(path: &PathBuf) -> Result<File> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    if unsafe { libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_RANDOM) } != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(File::new(file, path.to_string_lossy().into_owned())?)
}
