use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use common::config::env_or;

const DEFAULT_MAX_IN_MEM_KEYS: usize = 100_000;

/// Umbral máximo de claves en memoria (env MAX_IN_MEM_KEYS).
pub fn max_in_mem_keys() -> usize {
    env_or("MAX_IN_MEM_KEYS", DEFAULT_MAX_IN_MEM_KEYS).max(1)
}

/// Acumulador clave→suma con spill a disco cuando el mapa crece demasiado.
pub struct SpillingAggregator {
    map: HashMap<String, u64>,
    spill_files: Vec<PathBuf>,
    dir: PathBuf,
    threshold: usize,
}

impl SpillingAggregator {
    pub fn new(dir: &Path, threshold: usize) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            map: HashMap::new(),
            spill_files: Vec::new(),
            dir: dir.to_path_buf(),
            threshold: threshold.max(1),
        })
    }

    pub fn add(&mut self, key: &str, value: u64) -> io::Result<()> {
        *self.map.entry(key.to_string()).or_insert(0) += value;
        if self.map.len() >= self.threshold {
            self.spill()?;
        }
        Ok(())
    }

    fn spill(&mut self) -> io::Result<()> {
        if self.map.is_empty() {
            return Ok(());
        }

        let path = self
            .dir
            .join(format!("spill-{}-{}.csv", std::process::id(), self.spill_files.len()));
        let mut writer = BufWriter::new(File::create(&path)?);
        for (k, v) in self.map.drain() {
            writeln!(writer, "{},{}", k, v)?;
        }
        writer.flush()?;
        self.spill_files.push(path);
        Ok(())
    }

    /// Combina memoria + spills, escribe "clave,suma" ordenado por clave y
    /// borra los spills. Devuelve (bytes, filas) escritos.
    pub fn finalize_to_csv(mut self, output_path: &Path) -> io::Result<(u64, u64)> {
        let mut acc: HashMap<String, u64> = self.map.drain().collect();

        for spill in &self.spill_files {
            for line in BufReader::new(File::open(spill)?).lines() {
                let line = line?;
                if let Some((k, v)) = parse_pair(&line) {
                    *acc.entry(k.to_string()).or_insert(0) += v;
                }
            }
        }

        let mut entries: Vec<(String, u64)> = acc.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut writer = BufWriter::new(File::create(output_path)?);
        let mut bytes = 0;
        for (k, v) in &entries {
            let line = format!("{},{}\n", k, v);
            bytes += line.len() as u64;
            writer.write_all(line.as_bytes())?;
        }
        writer.flush()?;

        let _ = fs::remove_dir_all(&self.dir);
        Ok((bytes, entries.len() as u64))
    }
}

/// "clave,valor" → (clave, valor). La clave puede tener comas.
pub fn parse_pair(line: &str) -> Option<(&str, u64)> {
    let (k, v) = line.trim_end().rsplit_once(',')?;
    let v = v.trim().parse().ok()?;
    Some((k, v))
}

/// Reduce un archivo de pares "clave,valor" sumando por clave, en el lugar.
/// Las líneas que no son pares se descartan.
pub fn reduce_file_in_place(path: &Path, threshold: usize) -> io::Result<(u64, u64)> {
    let spill_dir = path.with_extension("spill");
    let mut agg = SpillingAggregator::new(&spill_dir, threshold)?;

    {
        let reader = BufReader::new(File::open(path)?);
        for line in reader.lines() {
            let line = line?;
            if let Some((k, v)) = parse_pair(&line) {
                agg.add(k, v)?;
            }
        }
    }

    let tmp = path.with_extension("reduced");
    let written = agg.finalize_to_csv(&tmp)?;
    fs::rename(&tmp, path)?;
    Ok(written)
}
