//! `rootcheck` — static checks for allocator usage and GC protection-stack
//! discipline over LLVM IR.
//!
//! Each subcommand below is an independent driver; none require the
//! others to have run first, so a reviewer can ask one narrow question
//! ("does this reach the allocator?") without paying for a full report.

mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use termcolor::ColorChoice;

use rootcheck_check::{
    allocator, balance, callee_protect, callgraph, error_paths, ffi, fresh, globals, maxarg,
    symbols, Messenger,
};
use rootcheck_ir::Module;

use output::{resolve_color_choice, StyledOutput};

#[derive(Parser)]
#[command(name = "rootcheck", version, about = "Allocator and GC protection-stack checks over LLVM IR")]
struct Cli {
    /// Color output: "auto" (default), "always", or "never".
    #[arg(long, global = true)]
    color: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ModuleArgs {
    /// Base module (bitcode `.bc` or textual `.ll`).
    base: PathBuf,

    /// A second module to link into the base, with its globals and
    /// functions downgraded to weak linkage first.
    #[arg(long)]
    link: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List functions inferred to allocate (context-insensitive).
    AllocList(ModuleArgs),
    /// List functions inferred to allocate, with per-call-site context.
    AllocListContext(ModuleArgs),
    /// Check protection-stack balance on every function.
    BalanceCheck(ModuleArgs),
    /// Check for unprotected pointers live across a GC safepoint.
    FreshCheck(ModuleArgs),
    /// List call sites that transitively reach an allocating function.
    Safepoints(ModuleArgs),
    /// List functions transitively reachable from `root` in the call graph.
    Callgraph {
        #[command(flatten)]
        module: ModuleArgs,
        root: String,
    },
    /// List functions inferred to never return to their caller.
    ErrorFuncs(ModuleArgs),
    /// Flag call sites with more than one allocating argument.
    MaxargCheck(ModuleArgs),
    /// Flag allocating arguments that escape before being protected.
    UnescapedArgCheck(ModuleArgs),
    /// Cross-check a native registration table's arity against its targets.
    FfiCheck {
        #[command(flatten)]
        module: ModuleArgs,
        table: String,
    },
    /// List globals whose type embeds a managed-pointer field.
    GlobalList(ModuleArgs),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let choice = resolve_color_choice(cli.color.as_deref());

    match dispatch(cli.command, choice) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load(args: &ModuleArgs) -> anyhow::Result<Module> {
    let module = match &args.link {
        Some(link) => Module::load_and_link(&args.base, link)?,
        None => Module::load(&args.base)?,
    };
    Ok(module)
}

fn print_diagnostics(out: &mut StyledOutput, messenger: &Messenger) {
    for diag in messenger.diagnostics() {
        out.diagnostic(diag);
    }
    out.flush();
}

fn dispatch(cmd: Commands, choice: ColorChoice) -> anyhow::Result<()> {
    let mut out = StyledOutput::new(choice);

    match cmd {
        Commands::AllocList(args) => {
            let module = load(&args)?;
            let allocators = allocator::infer_allocators(&module);
            for name in allocators.iter() {
                out.plain_line(&format!("POSSIBLE ALLOCATOR: {name}"));
            }
        }
        Commands::AllocListContext(args) => {
            let module = load(&args)?;
            let error_paths = error_paths::find_error_paths(&module);
            let call_graph = callgraph::build_call_graph(&module, &error_paths, None);
            let allocators = allocator::infer_allocators(&module);
            let syms = symbols::build_symbol_table(&module);
            let mut table = rootcheck_check::context::ContextTable::new();
            let vectors = rootcheck_check::vector_infer::infer_vector_returning(
                &module, &mut table, &allocators, &syms,
            );

            // Context-insensitive classifications (E + call-graph closure).
            let allocates = |name: &str| allocators.allocates(name);
            let allocating = |name: &str| call_graph.reachable_from(name).iter().any(|f| allocators.allocates(f));
            // Context-sensitive: true if *some* calling context of `name`
            // is known to return a vector.
            let callocator = |name: &str| {
                table
                    .iter()
                    .filter(|(_, f, _)| module.function_names().get(f.index()).map(String::as_str) == Some(name))
                    .any(|(id, _, _)| vectors.returns_vector(id))
            };

            for name in module.function_names() {
                if allocates(name) {
                    out.plain_line(&format!("ALLOCATOR: {name}"));
                }
                if allocating(name) {
                    out.plain_line(&format!("ALLOCATING: {name}"));
                }
                if callocator(name) {
                    out.plain_line(&format!("C-ALLOCATOR: {name}"));
                }
                // A context-sensitive call is "C-ALLOCATING" when its
                // callee, regardless of context, transitively reaches an
                // allocator — the call-graph closure is already
                // context-insensitive, so this coincides with `allocating`.
                if allocating(name) {
                    out.plain_line(&format!("C-ALLOCATING: {name}"));
                }
            }

            // Vector-inference messages (component G), one per non-default
            // call-site context.
            for (call_id, func_id, ctx) in table.iter() {
                if !rootcheck_check::context::is_non_default_context(ctx) {
                    continue;
                }
                let Some(name) = module.function_names().get(func_id.index()) else {
                    continue;
                };
                let label = format!("{name} in context {}", rootcheck_check::context::format_context(ctx));
                if vectors.returns_vector(call_id) {
                    out.plain_line(&format!("{label} returns only vectors"));
                } else {
                    out.plain_line(&format!("{label} may return non-vector"));
                }
            }

            // Sanity cross-check between the context-sensitive and
            // context-insensitive classifications.
            for name in module.function_names() {
                let is_allocator = allocates(name);
                let is_allocating = allocating(name);
                let is_callocator = callocator(name);
                let is_callocating = is_allocating;

                if !is_callocator && is_allocator {
                    out.good(&format!("NOT-C-ALLOCATOR but ALLOCATOR: {name}"));
                }
                if !is_callocating && is_allocating {
                    out.good(&format!("NOT-C-ALLOCATING but ALLOCATING: {name}"));
                }
                if is_callocator && !is_callocating {
                    out.bad(&format!("NOT-C-ALLOCATING but C-ALLOCATOR: {name}"));
                }
                if is_allocator && !is_allocating {
                    out.bad(&format!("NOT-ALLOCATING but ALLOCATOR: {name}"));
                }
                if is_callocator && !is_allocator {
                    out.bad(&format!("C-ALLOCATOR but not ALLOCATOR: {name}"));
                }
                if is_callocating && !is_allocating {
                    out.bad(&format!("C-ALLOCATING but not ALLOCATING: {name}"));
                }
            }
        }
        Commands::BalanceCheck(args) => {
            let module = load(&args)?;
            let mut messenger = Messenger::new();
            let result = balance::check_balance(&module, &mut messenger);
            print_diagnostics(&mut out, &messenger);
            out.success(&format!("checked {} functions", result.functions_checked));
        }
        Commands::FreshCheck(args) => {
            let module = load(&args)?;
            let error_paths = error_paths::find_error_paths(&module);
            let call_graph = callgraph::build_call_graph(&module, &error_paths, None);
            let allocators = allocator::infer_allocators(&module);
            let cprotect = callee_protect::infer_callee_protect(&module, &allocators, &call_graph);
            let mut messenger = Messenger::new();
            let result = fresh::check_fresh_variables(&module, &allocators, &cprotect, &mut messenger);
            print_diagnostics(&mut out, &messenger);
            out.success(&format!("checked {} functions", result.functions_checked));
        }
        Commands::Safepoints(args) => {
            let module = load(&args)?;
            let error_paths = error_paths::find_error_paths(&module);
            let allocators = allocator::infer_allocators(&module);
            let call_graph = callgraph::build_call_graph(&module, &error_paths, None);

            let mut locs = Vec::new();
            for func in &module.inner().functions {
                for block in &func.basic_blocks {
                    for inst in &block.instrs {
                        let llvm_ir::Instruction::Call(call) = inst else {
                            continue;
                        };
                        let Some(callee) = rootcheck_ir::patterns::called_function_name(call) else {
                            continue;
                        };
                        let reaches_allocator = allocators.allocates(&callee)
                            || allocators.iter().any(|a| call_graph.reaches_named(&callee, a));
                        if !reaches_allocator {
                            continue;
                        }
                        let loc = rootcheck_ir::SourceLoc::of(call);
                        if let Some(line) = loc.as_space_separated() {
                            locs.push(line);
                        }
                    }
                }
            }
            locs.sort();
            locs.dedup();
            for line in locs {
                out.plain_line(&line);
            }
        }
        Commands::Callgraph { module: margs, root } => {
            let module = load(&margs)?;
            let error_paths = error_paths::find_error_paths(&module);
            let call_graph = callgraph::build_call_graph(&module, &error_paths, None);
            for name in call_graph.reachable_from(&root) {
                out.plain_line(name);
            }
        }
        Commands::ErrorFuncs(args) => {
            let module = load(&args)?;
            let paths = error_paths::find_error_paths(&module);
            for name in paths.iter() {
                out.plain_line(name);
            }
        }
        Commands::MaxargCheck(args) => {
            let module = load(&args)?;
            let allocators = allocator::infer_allocators(&module);
            let mut messenger = Messenger::new();
            let result = maxarg::check_max_allocating_args(&module, &allocators, &mut messenger);
            print_diagnostics(&mut out, &messenger);
            out.success(&format!("checked {} call sites", result.call_sites_checked));
        }
        Commands::UnescapedArgCheck(args) => {
            let module = load(&args)?;
            let allocators = allocator::infer_allocators(&module);
            let mut messenger = Messenger::new();
            let result = fresh::unescaped::find_unescaped_allocating_args(&module, &allocators, &mut messenger);
            print_diagnostics(&mut out, &messenger);
            out.success(&format!("checked {} call sites", result.call_sites_checked));
        }
        Commands::FfiCheck { module: margs, table } => {
            let module = load(&margs)?;
            let mut messenger = Messenger::new();
            let result = ffi::check_ffi_table(&module, &table, &mut messenger);
            print_diagnostics(&mut out, &messenger);
            out.success(&format!("checked {} table entries", result.entries_checked));
        }
        Commands::GlobalList(args) => {
            let module = load(&args)?;
            for flagged in globals::list_hazardous_globals(&module) {
                out.plain_line(&format!("{}: {}", flagged.name, flagged.reason));
            }
        }
    }

    Ok(())
}
