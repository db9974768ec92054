//! the `jasmine` CLI: assembles, disassembles, compiles, relocates, or runs
//! a Jasmine object. run with `--help` for the flag set.

use std::io::{Read, Write};

use clap::{ArgGroup, Parser};
use jasmine::common::intern_global;
use jasmine::error::{JasmineError, LoadError};
use jasmine::object::{ArchTag, Object, OsTag};
use jasmine::target::{host_target, Os};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
#[command(group(ArgGroup::new("action").args(["run", "assemble", "disassemble", "compile", "relocate"]).required(true)))]
struct Args {
    /// load an object (default stdin), call `entry` (default `main`), exit with its return value
    #[arg(short = 'r', long)]
    run: bool,
    /// read text IR, emit an internal-format object holding binary IR
    #[arg(short = 'a', long)]
    assemble: bool,
    /// read an internal-format object holding binary IR, print text IR
    #[arg(short = 'd', long)]
    disassemble: bool,
    /// read an internal-format object with `arch = jasmine`, retarget to the host, emit an object
    #[arg(short = 'c', long)]
    compile: bool,
    /// retarget to the host if still IR, then emit a host-native relocatable object (ELF/COFF)
    #[arg(short = 'R', long)]
    relocate: bool,

    /// input file; defaults to stdin
    file: Option<String>,
    /// entry point symbol for --run
    #[arg(default_value = "main")]
    entry: String,

    /// redirect output here instead of stdout
    #[arg(short = 'o', long)]
    output: Option<String>,
}

fn read_input(file: &Option<String>) -> std::io::Result<Vec<u8>> {
    match file {
        Some(path) => std::fs::read(path),
        None => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf)?;
            Ok(buf)
        }
    }
}

fn write_output(output: &Option<String>, bytes: &[u8]) -> std::io::Result<()> {
    match output {
        Some(path) => std::fs::write(path, bytes),
        None => std::io::stdout().write_all(bytes),
    }
}

fn to_native(obj: Object) -> Result<Object, JasmineError> {
    if obj.arch == ArchTag::Jasmine {
        Ok(obj.retarget(host_target().as_ref())?)
    } else {
        Ok(obj)
    }
}

fn assemble(args: &Args) -> Result<(), JasmineError> {
    let bytes = read_input(&args.file)?;
    let text = String::from_utf8(bytes).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let parsed = jasmine::ir::text::parse(&text)?;
    let code = jasmine::ir::binary::assemble(&parsed.insns);
    let mut obj = Object::new(ArchTag::Jasmine, OsTag::None);
    obj.code = code;
    obj.types = parsed.types;
    write_output(&args.output, &obj.write_internal())?;
    Ok(())
}

fn disassemble(args: &Args) -> Result<(), JasmineError> {
    let bytes = read_input(&args.file)?;
    let obj = Object::read_internal(&bytes)?;
    let (insns, types) = jasmine::ir::binary::disassemble(obj.code.clone())?;
    let text = jasmine::ir::text::print_program(&insns, &types);
    write_output(&args.output, text.as_bytes())?;
    Ok(())
}

fn compile(args: &Args) -> Result<(), JasmineError> {
    let bytes = read_input(&args.file)?;
    let obj = Object::read_internal(&bytes)?;
    let native = to_native(obj)?;
    write_output(&args.output, &native.write_internal())?;
    Ok(())
}

fn relocate(args: &Args) -> Result<(), JasmineError> {
    let bytes = read_input(&args.file)?;
    let obj = Object::read_internal(&bytes)?;
    let native = to_native(obj)?;
    let target = host_target();
    let bytes = match target.os() {
        Os::Windows => native.write_coff(target.as_ref()),
        Os::Linux | Os::MacOs => native.write_elf(target.as_ref()),
    };
    write_output(&args.output, &bytes)?;
    Ok(())
}

/// Loads and runs an object, exiting the process with the called entry
/// point's return value. Never returns on success.
fn run(args: &Args) -> Result<(), JasmineError> {
    let bytes = read_input(&args.file)?;
    let obj = Object::read_internal(&bytes)?;
    let mut native = to_native(obj)?;
    native.load()?;

    let entry = intern_global(&args.entry);
    let addr = native
        .loaded_address(entry)
        .ok_or_else(|| LoadError::EntryNotFound(args.entry.clone()))?;
    let entry_fn: extern "C" fn() -> i32 = unsafe { std::mem::transmute(addr) };
    let code = entry_fn();
    std::process::exit(code);
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let result = if args.run {
        run(&args)
    } else if args.assemble {
        assemble(&args)
    } else if args.disassemble {
        disassemble(&args)
    } else if args.compile {
        compile(&args)
    } else {
        relocate(&args)
    };

    if let Err(e) = result {
        eprintln!("[ERROR] {e}");
        std::process::exit(1);
    }
}
