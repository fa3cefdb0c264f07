use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use flate2::read::MultiGzDecoder;

/// Uppercases ACGT, maps everything else (including lowercase ambiguity
/// codes) to 'N'. K-mer iteration downstream skips windows containing 'N'.
const SEQ_LETTERS_MAPPING: [u8; 256] = {
    let mut lookup = [b'N'; 256];
    lookup[b'A' as usize] = b'A';
    lookup[b'C' as usize] = b'C';
    lookup[b'G' as usize] = b'G';
    lookup[b'T' as usize] = b'T';
    lookup[b'a' as usize] = b'A';
    lookup[b'c' as usize] = b'C';
    lookup[b'g' as usize] = b'G';
    lookup[b't' as usize] = b'T';
    lookup
};

/// One record of a FASTA/FASTQ file, borrowed from the reader's buffers.
#[derive(Copy, Clone)]
pub struct FastaSequence<'a> {
    pub ident: &'a [u8],
    pub seq: &'a [u8],
}

enum FileType {
    Fasta,
    Fastq,
}

pub struct SequencesReader {
    ident: Vec<u8>,
    seq: Vec<u8>,
    line: Vec<u8>,
}

impl SequencesReader {
    const FASTQ_EXTS: &'static [&'static str] = &["fq", "fastq"];
    const FASTA_EXTS: &'static [&'static str] = &["fa", "fasta", "fna", "ffn"];

    pub fn new() -> Self {
        Self {
            ident: Vec::new(),
            seq: Vec::new(),
            line: Vec::new(),
        }
    }

    /// Streams every record of `source` to `func`, transparently inflating
    /// `.gz` files. The record type is recognized from the file extension,
    /// defaulting to FASTA when no known extension is present.
    pub fn process_file<F: FnMut(FastaSequence)>(
        &mut self,
        source: impl AsRef<Path>,
        mut func: F,
    ) -> std::io::Result<()> {
        let source = source.as_ref();

        let mut file_type = FileType::Fasta;
        let mut name = source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();

        let mut path: &Path = name.as_ref();
        while let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            if Self::FASTQ_EXTS.contains(&ext) {
                file_type = FileType::Fastq;
                break;
            }
            if Self::FASTA_EXTS.contains(&ext) {
                break;
            }
            name = &name[..name.len() - ext.len() - 1];
            path = name.as_ref();
        }

        let file = File::open(source)?;
        let reader: Box<dyn Read> = if source.extension().and_then(|e| e.to_str()) == Some("gz") {
            Box::new(MultiGzDecoder::new(file))
        } else {
            Box::new(file)
        };
        let mut reader = BufReader::with_capacity(1 << 16, reader);

        match file_type {
            FileType::Fasta => self.process_fasta(&mut reader, &mut func),
            FileType::Fastq => self.process_fastq(&mut reader, &mut func),
        }
    }

    fn next_line(&mut self, reader: &mut impl BufRead) -> std::io::Result<bool> {
        self.line.clear();
        let read = reader.read_until(b'\n', &mut self.line)?;
        while matches!(self.line.last(), Some(b'\n') | Some(b'\r')) {
            self.line.pop();
        }
        Ok(read > 0)
    }

    fn process_fasta<F: FnMut(FastaSequence)>(
        &mut self,
        reader: &mut impl BufRead,
        func: &mut F,
    ) -> std::io::Result<()> {
        self.ident.clear();
        self.seq.clear();

        loop {
            let has_line = self.next_line(reader)?;

            if !has_line || self.line.first() == Some(&b'>') {
                if !self.seq.is_empty() {
                    normalize_sequence(&mut self.seq);
                    func(FastaSequence {
                        ident: &self.ident,
                        seq: &self.seq,
                    });
                }
                if !has_line {
                    return Ok(());
                }
                self.ident.clear();
                self.ident.extend_from_slice(&self.line[1..]);
                self.seq.clear();
            } else {
                self.seq.extend_from_slice(&self.line);
            }
        }
    }

    fn process_fastq<F: FnMut(FastaSequence)>(
        &mut self,
        reader: &mut impl BufRead,
        func: &mut F,
    ) -> std::io::Result<()> {
        loop {
            if !self.next_line(reader)? {
                return Ok(());
            }
            if self.line.first() != Some(&b'@') {
                continue;
            }
            self.ident.clear();
            self.ident.extend_from_slice(&self.line[1..]);

            if !self.next_line(reader)? {
                return Ok(());
            }
            self.seq.clear();
            self.seq.append(&mut self.line);
            normalize_sequence(&mut self.seq);

            func(FastaSequence {
                ident: &self.ident,
                seq: &self.seq,
            });

            // Separator and quality lines
            self.next_line(reader)?;
            self.next_line(reader)?;
        }
    }
}

pub fn normalize_sequence(seq: &mut [u8]) {
    for el in seq.iter_mut() {
        *el = SEQ_LETTERS_MAPPING[*el as usize];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn collect_records(path: &Path) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut records = vec![];
        SequencesReader::new()
            .process_file(path, |record| {
                records.push((record.ident.to_vec(), record.seq.to_vec()));
            })
            .unwrap();
        records
    }

    #[test]
    fn multiline_fasta() {
        let path = std::env::temp_dir().join("ccdbg_io_test_multiline.fasta");
        let mut file = File::create(&path).unwrap();
        write!(file, ">first record\nACGT\nacgtn\n>second\nTTTT\n").unwrap();
        drop(file);

        let records = collect_records(&path);
        std::fs::remove_file(&path).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, b"first record");
        assert_eq!(records[0].1, b"ACGTACGTN");
        assert_eq!(records[1].0, b"second");
        assert_eq!(records[1].1, b"TTTT");
    }

    #[test]
    fn fastq_records() {
        let path = std::env::temp_dir().join("ccdbg_io_test.fastq");
        let mut file = File::create(&path).unwrap();
        write!(file, "@r1\nACGT\n+\nIIII\n@r2\nGGCC\n+\nIIII\n").unwrap();
        drop(file);

        let records = collect_records(&path);
        std::fs::remove_file(&path).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].1, b"ACGT");
        assert_eq!(records[1].0, b"r2");
        assert_eq!(records[1].1, b"GGCC");
    }
}
