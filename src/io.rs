//! Snapshot output.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
};

use crate::part::{GPart, Part, SPart};

/// The particle state of one rank at a snapshot time.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot<'a> {
    pub index: usize,
    pub time: f64,
    pub parts: &'a [Part],
    pub gparts: &'a [GPart],
    pub sparts: &'a [SPart],
}

pub trait SnapshotWriter: Send + Sync {
    fn write(&self, snapshot: &Snapshot, rank: usize, nr_nodes: usize) -> std::io::Result<()>;
}

/// Writes one tab separated text file per rank and snapshot.
#[derive(Debug, Clone)]
pub struct TextSnapshotWriter {
    basename: String,
}

impl TextSnapshotWriter {
    pub fn new(basename: impl Into<String>) -> Self {
        Self {
            basename: basename.into(),
        }
    }

    pub fn filename(&self, index: usize, rank: usize) -> PathBuf {
        PathBuf::from(format!("{}_{:04}.{}.txt", self.basename, index, rank))
    }
}

impl SnapshotWriter for TextSnapshotWriter {
    fn write(&self, snapshot: &Snapshot, rank: usize, nr_nodes: usize) -> std::io::Result<()> {
        let filename = self.filename(snapshot.index, rank);
        let mut f = BufWriter::new(File::create(&filename)?);
        writeln!(f, "# Time: {}", snapshot.time)?;
        writeln!(f, "# Rank: {} of {}", rank, nr_nodes)?;
        writeln!(f, "# type\tid\tx\ty\tz\tvx\tvy\tvz\tmass\th\trho\tu")?;
        for part in snapshot.parts.iter() {
            writeln!(
                f,
                "gas\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                part.id, part.x.x, part.x.y, part.x.z, part.v.x, part.v.y, part.v.z, part.mass, part.h, part.rho, part.u
            )?;
        }
        for gpart in snapshot.gparts.iter().filter(|g| !g.has_partner()) {
            writeln!(
                f,
                "dark_matter\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t0\t0\t0",
                gpart.id, gpart.x.x, gpart.x.y, gpart.x.z, gpart.v.x, gpart.v.y, gpart.v.z, gpart.mass
            )?;
        }
        for spart in snapshot.sparts.iter() {
            writeln!(
                f,
                "star\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t0\t0\t0",
                spart.id, spart.x.x, spart.x.y, spart.x.z, spart.v.x, spart.v.y, spart.v.z, spart.mass
            )?;
        }
        f.flush()?;
        tracing::info!("Written snapshot {} to {}.", snapshot.index, filename.display());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use glam::DVec3;

    use super::*;

    #[test]
    fn test_text_snapshot() {
        let dir = std::env::temp_dir().join(format!("cosmo_tasks_io_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let writer = TextSnapshotWriter::new(dir.join("test").to_string_lossy());
        let parts = vec![Part {
            id: 3,
            x: DVec3::splat(0.5),
            mass: 1.,
            ..Default::default()
        }];
        let snapshot = Snapshot {
            index: 7,
            time: 0.25,
            parts: &parts,
            gparts: &[GPart::default()],
            sparts: &[],
        };
        writer.write(&snapshot, 1, 2).unwrap();
        let filename = writer.filename(7, 1);
        assert!(filename.to_string_lossy().ends_with("test_0007.1.txt"));
        let content = std::fs::read_to_string(filename).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[3].starts_with("gas\t3\t0.5"));
        assert!(lines[4].starts_with("dark_matter"));
        std::fs::remove_dir_all(dir).unwrap();
    }
}
