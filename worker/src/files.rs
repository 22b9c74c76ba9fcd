use common::LocalFile;
use glob::{glob, Pattern};
use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::{Component, Path, PathBuf},
};

/// Archivos bajo `dir` (recursivo), con su tamaño y cantidad de líneas como
/// cantidad de registros. Los nombres quedan relativos a `dir`.
pub fn scan_data_dir(dir: &Path) -> io::Result<Vec<LocalFile>> {
    let pattern = format!("{}/**/*", Pattern::escape(&dir.to_string_lossy()));
    let entries = glob(&pattern)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{pattern}: {e}")))?;

    let mut out = Vec::new();
    for path in entries.flatten() {
        if !path.is_file() {
            continue;
        }
        let Ok(rel) = path.strip_prefix(dir) else {
            continue;
        };
        let size = path.metadata()?.len();
        let records = count_lines(&path)?;
        out.push(LocalFile {
            name: rel.to_string_lossy().replace('\\', "/"),
            size,
            records,
        });
    }

    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

pub fn count_lines(path: &Path) -> io::Result<i64> {
    let reader = BufReader::new(File::open(path)?);
    let mut n = 0;
    for line in reader.split(b'\n') {
        line?;
        n += 1;
    }
    Ok(n)
}

/// Path local de un archivo lógico. No se aceptan nombres que salgan de `dir`.
pub fn resolve(dir: &Path, name: &str) -> io::Result<PathBuf> {
    let rel = Path::new(name.trim_start_matches('/'));
    if rel
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("nombre fuera del directorio de datos: {name}"),
        ));
    }
    Ok(dir.join(rel))
}

/// Lee `length` registros (líneas) desde el registro `offset`.
/// `length < 0` = hasta el final del archivo.
pub fn read_records(path: &Path, offset: i64, length: i64) -> io::Result<Vec<String>> {
    let reader = BufReader::new(File::open(path)?);
    let skip = offset.max(0) as usize;
    let take = if length < 0 { usize::MAX } else { length as usize };

    let mut out = Vec::new();
    for line in reader.split(b'\n').skip(skip).take(take) {
        let mut bytes = line?;
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        out.push(String::from_utf8_lossy(&bytes).into_owned());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = std::env::temp_dir().join("worker_files_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    #[test]
    fn scan_lista_archivos_con_registros() {
        let tmp = temp_dir("scan");
        fs::create_dir_all(tmp.join("sub")).unwrap();
        fs::write(tmp.join("a.txt"), "uno\ndos\ntres\n").unwrap();
        fs::write(tmp.join("sub").join("b.csv"), "x,1\ny,2").unwrap();
        fs::write(tmp.join("vacio"), "").unwrap();

        let files = scan_data_dir(&tmp).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "sub/b.csv", "vacio"]);

        assert_eq!(files[0].records, 3);
        assert_eq!(files[0].size, 13);
        // sin salto final también cuenta la última línea
        assert_eq!(files[1].records, 2);
        assert_eq!(files[2].records, 0);
    }

    #[test]
    fn read_records_respeta_offset_y_largo() {
        let tmp = temp_dir("read");
        let path = tmp.join("datos.txt");
        let mut f = fs::File::create(&path).unwrap();
        for i in 0..10 {
            writeln!(f, "linea {}", i).unwrap();
        }

        let rows = read_records(&path, 3, 4).unwrap();
        assert_eq!(rows, vec!["linea 3", "linea 4", "linea 5", "linea 6"]);

        // el último segmento puede pedir de más
        assert_eq!(read_records(&path, 8, 5).unwrap().len(), 2);
        assert_eq!(read_records(&path, 0, -1).unwrap().len(), 10);
        assert!(read_records(&tmp.join("no_existe"), 0, -1).is_err());
    }

    #[test]
    fn resolve_no_sale_del_directorio() {
        let dir = Path::new("/data");
        assert_eq!(resolve(dir, "a/b.txt").unwrap(), PathBuf::from("/data/a/b.txt"));
        assert_eq!(resolve(dir, "/x.txt").unwrap(), PathBuf::from("/data/x.txt"));
        assert!(resolve(dir, "../etc/passwd").is_err());
    }
}
