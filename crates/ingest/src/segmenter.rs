use bytes::Bytes;

/// A fixed-duration slice of a video, as emitted by the segmenter, with
/// its byte checksum already computed.
#[derive(Debug, Clone)]
pub struct SegmentedChunk {
    pub sequence_num: u32,
    pub data: Bytes,
    pub checksum: String,
}

/// The demuxing/segmenting pipeline V-Stack ingests from. The real one
/// wraps a media toolchain; this interface is all the worker depends on.
pub trait Segmenter {
    /// Seconds of media each chunk covers.
    fn chunk_duration_sec(&self) -> i64;

    /// Produce all chunks of the source, dense and zero-based.
    fn segments(&mut self) -> std::io::Result<Vec<SegmentedChunk>>;
}

/// A segmenter over a raw file: slices it into fixed-size pieces and
/// treats each as one chunk duration of media. Stands in for a real
/// demuxer in tests and rehearsals.
pub struct FileSegmenter {
    path: std::path::PathBuf,
    chunk_size_bytes: usize,
    chunk_duration_sec: i64,
}

impl FileSegmenter {
    pub fn new(
        path: impl Into<std::path::PathBuf>,
        chunk_size_bytes: usize,
        chunk_duration_sec: i64,
    ) -> Self {
        Self {
            path: path.into(),
            chunk_size_bytes,
            chunk_duration_sec,
        }
    }
}

impl Segmenter for FileSegmenter {
    fn chunk_duration_sec(&self) -> i64 {
        self.chunk_duration_sec
    }

    fn segments(&mut self) -> std::io::Result<Vec<SegmentedChunk>> {
        let data = std::fs::read(&self.path)?;
        let chunks = data
            .chunks(self.chunk_size_bytes)
            .enumerate()
            .map(|(sequence, slice)| SegmentedChunk {
                sequence_num: sequence as u32,
                checksum: models::content_checksum(slice),
                data: Bytes::copy_from_slice(slice),
            })
            .collect();
        Ok(chunks)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn slices_a_file_into_dense_chunks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[7u8; 2500]).unwrap();

        let mut segmenter = FileSegmenter::new(file.path(), 1000, 10);
        let chunks = segmenter.segments().unwrap();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].data.len(), 1000);
        assert_eq!(chunks[1].data.len(), 1000);
        assert_eq!(chunks[2].data.len(), 500);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.sequence_num, i as u32);
            assert_eq!(chunk.checksum, models::content_checksum(&chunk.data));
        }
    }

    #[test]
    fn empty_file_yields_no_chunks() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut segmenter = FileSegmenter::new(file.path(), 1000, 10);
        assert!(segmenter.segments().unwrap().is_empty());
    }
}
