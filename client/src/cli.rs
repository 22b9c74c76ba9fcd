use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;

use common::{Endpoint, SchedulerConfig, SegmentOutcome};
use sphere::{
    BucketOutput, HttpCoordinator, OutputSpec, ReadResult, SphereProcess, TcpDataChannel,
};

#[derive(Parser)]
#[command(name = "sphere")]
#[command(about = "Corre UDFs sobre los archivos de los workers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Corre una UDF sobre uno o más archivos (se aceptan globs)
    Run {
        #[arg(value_name = "ARCHIVOS", required = true)]
        inputs: Vec<String>,

        /// identity, wordcount o grep
        #[arg(long, default_value = "identity")]
        op: String,

        /// Parámetro de la UDF (por ejemplo el patrón de grep)
        #[arg(long, default_value = "")]
        param: String,

        /// Registros por llamada a la UDF; 0 = un segmento por archivo
        #[arg(long, default_value_t = 0)]
        rows: i64,

        /// Cada worker escribe la salida en este path de su nodo
        #[arg(long, conflicts_with = "buckets")]
        local: Option<String>,

        /// Directorio de salida de los buckets (shuffle por clave)
        #[arg(long)]
        buckets: Option<String>,

        /// Prefijo de los archivos de salida en modo buckets
        #[arg(long, default_value = "part")]
        name: String,

        /// Archivos lógicos de salida en modo buckets (0 = uno por bucket)
        #[arg(long, default_value_t = 0)]
        files: usize,

        /// Pista de ubicación para un archivo de salida: IDX=HOST:PUERTO
        #[arg(long = "hint", value_name = "IDX=HOST:PUERTO")]
        hints: Vec<String>,

        /// Reducir por clave al cerrar los buckets
        #[arg(long, requires = "buckets")]
        mr: bool,

        #[arg(long)]
        min_unit_size: Option<u64>,

        #[arg(long)]
        max_unit_size: Option<u64>,

        /// Slots por worker
        #[arg(long)]
        procs: Option<usize>,

        /// Sólo correr cada segmento donde están sus datos
        #[arg(long)]
        no_data_move: bool,
    },

    /// Lista los workers registrados en el master
    Workers,
}

/// "IDX=HOST:PUERTO" -> (IDX, endpoint)
fn parse_hint(s: &str) -> Result<(usize, Endpoint)> {
    let Some((idx, addr)) = s.split_once('=') else {
        bail!("pista inválida '{s}', se espera IDX=HOST:PUERTO");
    };
    let idx: usize = idx.trim().parse()?;
    let endpoint: Endpoint = addr
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("pista inválida '{s}': {e}"))?;
    Ok((idx, endpoint))
}

fn bucket_output(
    path: String,
    name: String,
    files: usize,
    hints: &[String],
) -> Result<BucketOutput> {
    let mut out = BucketOutput {
        path,
        name,
        files,
        hints: Vec::new(),
    };
    for h in hints {
        let (idx, endpoint) = parse_hint(h)?;
        if out.hints.len() <= idx {
            out.hints.resize(idx + 1, None);
        }
        out.hints[idx] = Some(endpoint);
    }
    Ok(out)
}

fn print_result(outcome: &SegmentOutcome) {
    match outcome {
        SegmentOutcome::Data { data, .. } => {
            print!("{}", String::from_utf8_lossy(data));
        }
        SegmentOutcome::Written { .. } => {}
        SegmentOutcome::Failed { code, detail } => {
            eprintln!("  segmento fallido (código {code}): {detail}");
        }
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let coordinator = HttpCoordinator::from_env();

    match cli.command {
        Commands::Run {
            inputs,
            op,
            param,
            rows,
            local,
            buckets,
            name,
            files,
            hints,
            mr,
            min_unit_size,
            max_unit_size,
            procs,
            no_data_move,
        } => {
            let mut process = SphereProcess::new(
                Arc::new(coordinator),
                Arc::new(TcpDataChannel::new()),
                SchedulerConfig::from_env(),
            );
            if let Some(v) = min_unit_size {
                process.set_min_unit_size(v);
            }
            if let Some(v) = max_unit_size {
                process.set_max_unit_size(v);
            }
            if let Some(v) = procs {
                process.set_proc_num_per_node(v);
            }
            if no_data_move {
                process.set_data_move_attr(false);
            }

            let input = process.prepare_input(&inputs).await?;
            if input.files.is_empty() {
                bail!("ningún archivo coincide con {:?}", inputs);
            }
            println!(
                "Entrada: {} archivos, {} bytes",
                input.file_count(),
                input.total_size()
            );

            match (buckets, local) {
                (Some(dir), _) => {
                    let output = bucket_output(dir, name, files, &hints)?;
                    if mr {
                        process.run_mr(&input, output, &op, rows, &param).await?;
                    } else {
                        process
                            .run(&input, OutputSpec::Buckets(output), &op, rows, &param)
                            .await?;
                    }
                }
                (None, Some(path)) => {
                    process
                        .run(&input, OutputSpec::LocalFile { path }, &op, rows, &param)
                        .await?;
                }
                (None, None) => {
                    process
                        .run(&input, OutputSpec::Direct, &op, rows, &param)
                        .await?;
                }
            }

            let mut failed = 0;
            loop {
                match process.read(true).await? {
                    ReadResult::Segment(res) => {
                        if res.is_failed() {
                            failed += 1;
                        }
                        print_result(&res.outcome);
                    }
                    ReadResult::Finished => break,
                }
            }
            process.close().await;

            println!("Job terminado ({} segmentos fallidos)", failed);
            if let Some(out) = process.output() {
                for f in out.files {
                    println!("  {} : {} bytes, {} registros", f.name, f.size, f.records);
                }
            }
        }

        Commands::Workers => {
            let workers = coordinator.list_workers().await?;
            if workers.is_empty() {
                println!("No hay workers registrados.");
            }
            for w in workers {
                println!("Worker {}", w.worker_id);
                println!("  host           : {}", w.hostname);
                println!("  datos          : {}", w.data);
                println!("  shuffler       : {}", w.control);
                println!("  dead           : {}", w.dead);
                println!("  last_heartbeat : {} s ago", w.last_heartbeat_secs_ago);
                println!("  concurrency    : max={}", w.max_concurrency);
                println!("  archivos       : {}", w.files);
                println!(
                    "  sesiones       : {} (shufflers: {})",
                    w.sessions_started, w.shufflers_started
                );
                match w.cpu_percent {
                    Some(cpu) => println!("  cpu_percent    : {:.1}%", cpu),
                    None => println!("  cpu_percent    : (sin datos)"),
                }
                match w.mem_bytes {
                    Some(mem) => println!("  mem_bytes      : {}", mem),
                    None => println!("  mem_bytes      : (sin datos)"),
                }
                println!();
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsea_pistas_de_ubicacion() {
        let out = bucket_output(
            "/out".into(),
            "wc".into(),
            4,
            &["2=10.0.0.5:6001".to_string(), "0=worker1:7000".to_string()],
        )
        .unwrap();
        assert_eq!(out.hints.len(), 3);
        assert_eq!(out.hints[0], Some(Endpoint::new("worker1", 7000)));
        assert_eq!(out.hints[1], None);
        assert_eq!(out.hints[2], Some(Endpoint::new("10.0.0.5", 6001)));

        assert!(parse_hint("sin-igual").is_err());
        assert!(parse_hint("x=10.0.0.1:1").is_err());
    }

    #[test]
    fn cli_acepta_modo_buckets() {
        let cli = Cli::try_parse_from([
            "sphere", "run", "/data/*.txt", "--op", "wordcount", "--buckets", "/out", "--mr",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { buckets, mr, inputs, .. } => {
                assert_eq!(buckets.as_deref(), Some("/out"));
                assert!(mr);
                assert_eq!(inputs, vec!["/data/*.txt"]);
            }
            Commands::Workers => panic!("se esperaba run"),
        }

        // --mr sin --buckets no tiene sentido
        assert!(Cli::try_parse_from(["sphere", "run", "a", "--mr"]).is_err());
    }
}
