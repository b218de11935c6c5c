use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use slog::{debug, info, warn, Logger};

use crate::{
    Coordinate, FetchTarget, LocateOutcome, ObservationSource, RawObservation, SatellitePixel,
    SourceKind, SwathError, SwathReader,
};

#[derive(Debug, Default)]
pub struct SwathBatch {
    pub pixels: Vec<SatellitePixel>,
    pub no_coverage: usize,
    pub failed: usize,
}

/// Every swath file in one directory, processed once per cycle
pub struct SwathDirectory {
    dir: PathBuf,
    reader: Arc<dyn SwathReader>,
    logger: Logger,
}

impl SwathDirectory {
    pub fn new(dir: impl Into<PathBuf>, reader: Arc<dyn SwathReader>, logger: Logger) -> Self {
        Self {
            dir: dir.into(),
            reader,
            logger,
        }
    }

    /// `.nc` files in name order (TEMPO names sort chronologically)
    pub fn list_files(&self) -> Result<Vec<PathBuf>, SwathError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| SwathError::Read {
            path: self.dir.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "nc"))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Nearest pixel to `target` in every file.
    ///
    /// Unreadable files are logged and counted; the batch only fails when
    /// there were files and none of them could be read.
    pub fn extract(&self, target: Coordinate) -> Result<SwathBatch, SwathError> {
        let files = self.list_files()?;
        let mut batch = SwathBatch::default();

        for path in &files {
            match extract_one(self.reader.as_ref(), path, target) {
                Ok(Some(pixel)) => {
                    debug!(
                        self.logger,
                        "{}: pixel {:?} at {} value {}",
                        pixel.file_name,
                        pixel.grid_index,
                        pixel.coordinate,
                        pixel.value
                    );
                    batch.pixels.push(pixel);
                }
                Ok(None) => {
                    debug!(self.logger, "{}: target outside swath", path.display());
                    batch.no_coverage += 1;
                }
                Err(e) => {
                    warn!(self.logger, "skipping swath file: {}", e);
                    batch.failed += 1;
                }
            }
        }

        if !files.is_empty() && batch.failed == files.len() {
            return Err(SwathError::AllFilesFailed {
                attempted: files.len(),
            });
        }
        info!(
            self.logger,
            "swath batch: {} files, {} pixels, {} without coverage, {} failed",
            files.len(),
            batch.pixels.len(),
            batch.no_coverage,
            batch.failed
        );
        Ok(batch)
    }
}

fn extract_one(
    reader: &dyn SwathReader,
    path: &Path,
    target: Coordinate,
) -> Result<Option<SatellitePixel>, SwathError> {
    let product = reader.read(path)?;
    let found = match product.grid.locate(target) {
        LocateOutcome::Located(found) => found,
        LocateOutcome::NoCoverage => return Ok(None),
    };
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    Ok(Some(SatellitePixel {
        file_name,
        species: product.species,
        value: found.value,
        unit: product.unit,
        coordinate: found.coordinate,
        scan_time: found.scan_time,
        grid_index: (found.row, found.col),
    }))
}

#[async_trait]
impl ObservationSource for SwathDirectory {
    fn kind(&self) -> SourceKind {
        SourceKind::Satellite
    }

    async fn fetch(&self, target: &FetchTarget) -> Result<Vec<RawObservation>, anyhow::Error> {
        let dir = self.dir.clone();
        let reader = Arc::clone(&self.reader);
        let logger = self.logger.clone();
        let center = target.center;

        // file decoding is blocking I/O
        let batch = tokio::task::spawn_blocking(move || {
            SwathDirectory::new(dir, reader, logger).extract(center)
        })
        .await??;

        Ok(batch
            .pixels
            .into_iter()
            .map(RawObservation::SatellitePixel)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::satellite::swath::nyc_grid;
    use crate::{Parameter, SwathProduct};
    use slog::{o, Discard};

    struct FakeReader;

    impl SwathReader for FakeReader {
        fn read(&self, path: &Path) -> Result<SwathProduct, SwathError> {
            let name = path.file_name().unwrap().to_string_lossy();
            if name.starts_with("corrupt") {
                return Err(SwathError::Read {
                    path: name.to_string(),
                    reason: "bad header".to_string(),
                });
            }
            Ok(SwathProduct {
                grid: nyc_grid(6, 6),
                species: Parameter::No2,
                unit: "molecules/cm^2".to_string(),
            })
        }
    }

    fn directory_with(names: &[&str]) -> (tempfile::TempDir, SwathDirectory) {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let swaths = SwathDirectory::new(
            dir.path(),
            Arc::new(FakeReader),
            Logger::root(Discard, o!()),
        );
        (dir, swaths)
    }

    #[test]
    fn bad_file_does_not_abort_batch() {
        let (_dir, swaths) = directory_with(&["a.nc", "corrupt.nc", "b.nc", "notes.txt"]);
        let batch = swaths.extract(Coordinate::new(40.7128, -74.0060)).unwrap();
        assert_eq!(batch.pixels.len(), 2);
        assert_eq!(batch.failed, 1);
        assert_eq!(batch.pixels[0].file_name, "a.nc");
        assert_eq!(batch.pixels[1].file_name, "b.nc");
    }

    #[test]
    fn uncovered_target_is_counted_not_matched() {
        let (_dir, swaths) = directory_with(&["a.nc"]);
        let batch = swaths.extract(Coordinate::new(34.05, -118.24)).unwrap();
        assert!(batch.pixels.is_empty());
        assert_eq!(batch.no_coverage, 1);
    }

    #[test]
    fn every_file_failing_fails_the_batch() {
        let (_dir, swaths) = directory_with(&["corrupt1.nc", "corrupt2.nc"]);
        let err = swaths.extract(Coordinate::new(40.7, -74.0)).unwrap_err();
        assert!(matches!(err, SwathError::AllFilesFailed { attempted: 2 }));
    }

    #[test]
    fn empty_directory_is_an_empty_batch() {
        let (_dir, swaths) = directory_with(&[]);
        let batch = swaths.extract(Coordinate::new(40.7, -74.0)).unwrap();
        assert!(batch.pixels.is_empty());
    }

    #[tokio::test]
    async fn fetch_wraps_pixels_as_raw_observations() {
        let (_dir, swaths) = directory_with(&["a.nc"]);
        let target = FetchTarget::new(Coordinate::new(40.7128, -74.0060), 25_000.0);
        let raws = swaths.fetch(&target).await.unwrap();
        assert_eq!(raws.len(), 1);
        assert!(matches!(raws[0], RawObservation::SatellitePixel(_)));
    }
}
