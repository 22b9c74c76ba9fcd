//! UDFs incluidas en el worker. Cada fila de salida lleva la clave con la
//! que se reparte entre buckets.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRow {
    pub key: String,
    pub line: String,
}

impl OutputRow {
    /// Bytes que ocupa la fila escrita (con el salto de línea).
    pub fn byte_len(&self) -> u64 {
        self.line.len() as u64 + 1
    }
}

pub const UDFS: &[&str] = &["identity", "wordcount", "grep"];

pub fn is_known(op: &str) -> bool {
    UDFS.contains(&op)
}

/// Limpia una palabra: sólo alfanuméricos y '_', en minúscula.
fn normalize_token(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect::<String>()
        .to_lowercase()
}

fn identity(lines: &[String], out: &mut Vec<OutputRow>) {
    for line in lines {
        let key = line.split(',').next().unwrap_or_default().to_string();
        out.push(OutputRow {
            key,
            line: line.clone(),
        });
    }
}

// "token,1" por cada palabra; el reduce del shuffler suma por token
fn wordcount(lines: &[String], out: &mut Vec<OutputRow>) {
    for line in lines {
        for raw in line.split_whitespace() {
            let token = normalize_token(raw);
            if !token.is_empty() {
                out.push(OutputRow {
                    line: format!("{},1", token),
                    key: token,
                });
            }
        }
    }
}

fn grep(pattern: &str, lines: &[String], out: &mut Vec<OutputRow>) {
    for line in lines.iter().filter(|l| l.contains(pattern)) {
        out.push(OutputRow {
            key: line.clone(),
            line: line.clone(),
        });
    }
}

/// Corre la UDF `op` sobre los registros, en lotes de `rows` (0 = todos).
pub fn apply(op: &str, param: &str, lines: &[String], rows: i64) -> Result<Vec<OutputRow>, String> {
    if !is_known(op) {
        return Err(format!("udf desconocida: {op}"));
    }

    let batch = if rows <= 0 {
        lines.len().max(1)
    } else {
        rows as usize
    };

    let mut out = Vec::new();
    for chunk in lines.chunks(batch) {
        match op {
            "identity" => identity(chunk, &mut out),
            "wordcount" => wordcount(chunk, &mut out),
            "grep" => grep(param, chunk, &mut out),
            _ => return Err(format!("udf desconocida: {op}")),
        }
    }
    Ok(out)
}
