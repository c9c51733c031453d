use std::fs;
use std::process::ExitCode;

use clap::Parser;
use microdeco::cfg::{build_call_graph, build_cfg, call_graph_to_dot, graph_to_dot};
use microdeco::parser::{parse_func_spec, parse_number, parse_want_spec};
use microdeco::{isa, IsaDisplay, Section, World, WorldConfig};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Demo image for the mini ISA: a branch, a call and a constant return.
const DEMO_IMAGE: &[u8] = &[
    0x27, 0x00, 0x0c, 0x00, // 00: beqz r0, 0x0c
    0x24, 0x00, 0x20, 0x00, // 04: call 0x20
    0x2c, // 08: ret
    0x00, 0x00, 0x00, // 09: nop
    0x01, 0x00, 0x01, 0x00, // 0c: movi r0, 1
    0x2c, // 10: ret
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // 11: nop
    0x01, 0x00, 0x07, 0x00, // 20: movi r0, 7
    0x2c, // 24: ret
];

#[derive(Parser, Debug)]
/// Decompile a raw code image into structured pseudo-code
struct Args {
    /// Raw code image (if not given, use the built-in demo)
    #[clap(short, long)]
    image: Option<String>,
    /// Load address of the image
    #[clap(long, default_value = "0", value_parser = parse_addr)]
    base: u64,
    /// Instruction set
    #[clap(long, default_value = "mini")]
    isa: String,
    /// Function entry as `addr` or `addr=name`; repeatable
    #[clap(short, long = "func")]
    funcs: Vec<String>,
    /// Register every listed function should return, as `reg` or `reg:mask`
    #[clap(short, long = "want")]
    wants: Vec<String>,
    /// Pass limit per function
    #[clap(long, default_value_t = WorldConfig::default().max_passes)]
    max_passes: u32,
    /// Dump each function's block graph as DOT
    #[clap(long)]
    cfg_dot: bool,
    /// Dump the call graph as DOT
    #[clap(long)]
    call_dot: bool,
}

fn parse_addr(s: &str) -> Result<u64, String> {
    parse_number(s)
        .filter(|v| *v >= 0)
        .map(|v| v as u64)
        .ok_or_else(|| format!("bad address `{s}`"))
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,microdeco=info"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn run(args: &Args) -> Result<(), String> {
    let isa = isa::by_name(&args.isa).ok_or_else(|| format!("unknown isa `{}`", args.isa))?;
    let data = match &args.image {
        Some(path) => fs::read(path).map_err(|e| format!("cannot read {path}: {e}"))?,
        None => DEMO_IMAGE.to_vec(),
    };
    let mut world = World::new(WorldConfig { max_passes: args.max_passes });
    let dom = world.add_domain(isa.clone());
    world.add_code(dom, Section::new(args.base, data));

    let mut specs = Vec::new();
    for spec in &args.funcs {
        specs.push(parse_func_spec(spec).ok_or_else(|| format!("bad function spec `{spec}`"))?);
    }
    if specs.is_empty() {
        specs.push((args.base, Some("main".to_string())));
    }
    let mut wants = Vec::new();
    for spec in &args.wants {
        let (name, mask) = parse_want_spec(spec).ok_or_else(|| format!("bad register spec `{spec}`"))?;
        let reg = isa.reg_by_name(&name).ok_or_else(|| format!("unknown register `{name}`"))?;
        wants.push((reg, mask.unwrap_or(isa.reg(reg).mask)));
    }
    if args.image.is_none() && wants.is_empty() {
        if let Some(r0) = isa.reg_by_name("r0") {
            wants.push((r0, isa.reg(r0).mask));
        }
    }

    let mut roots = Vec::new();
    for (addr, name) in specs {
        let id = world
            .add_function(dom, addr, name.as_deref())
            .ok_or_else(|| format!("no code mapped at {addr:#x}"))?;
        for (reg, mask) in &wants {
            world.want_reg(id, *reg, *mask);
        }
        roots.push(id);
    }
    info!(funcs = roots.len(), isa = isa.name(), "decompiling");
    if let Err(err) = world.process() {
        error!(%err, "analysis stopped early");
    }

    let ctx = IsaDisplay::with_world(&*isa, &world);
    for f in &world.funcs {
        println!("{}", f.render(&ctx));
        if args.cfg_dot {
            if let Some(body) = &f.body {
                println!("{}", graph_to_dot(&build_cfg(body)));
            }
        }
    }
    if args.call_dot {
        println!("{}", call_graph_to_dot(&world, &build_call_graph(&world)));
    }
    Ok(())
}

fn main() -> ExitCode {
    init_logging();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            error!("{msg}");
            ExitCode::FAILURE
        }
    }
}
