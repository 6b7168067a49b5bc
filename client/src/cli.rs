use anyhow::{bail, Result};
use bptl_common::registry::HandlerRegistration;
use bptl_common::{
    validate_mapping, App, Config, ExternalTask, LocalId, MappingStore, TaskMapping, TaskStore,
};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "bptl")]
#[command(about = "CLI de administración del worker de tareas externas")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ejecuta y completa una tarea guardada
    ExecuteTask {
        #[arg(value_name = "TASK_ID")]
        id: LocalId,

        /// Vuelve la tarea a `initial` con un lock nuevo antes de ejecutarla
        #[arg(long)]
        force: bool,
    },
    /// Fetch-and-lock, ejecución y complete de hasta MAX tareas
    ExecuteTasks {
        #[arg(value_name = "MAX")]
        max_tasks: u32,
    },
    /// Sólo fetch-and-lock: bloquea y guarda hasta MAX tareas
    FetchAndLock {
        #[arg(value_name = "MAX")]
        max_tasks: u32,
    },
    /// Lista los handlers registrados con su documentación
    ShowTaskRegistry,
    /// Tabla de ruteo topic -> handler
    Mappings {
        #[command(subcommand)]
        command: MappingCommands,
    },
    /// Tareas guardadas localmente
    Tasks {
        #[command(subcommand)]
        command: TaskCommands,
    },
}

#[derive(Subcommand)]
enum MappingCommands {
    /// Lista los mappings configurados
    List,
    /// Crea o reemplaza el mapping de un topic
    Set {
        #[arg(value_name = "TOPIC")]
        topic: String,

        #[arg(value_name = "CALLBACK")]
        callback: String,

        /// Deja el mapping desactivado (el worker no pide tareas del topic)
        #[arg(long)]
        inactive: bool,

        /// Alias de servicio configurado para el topic (repetible)
        #[arg(long = "service", value_name = "ALIAS")]
        services: Vec<String>,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Lista las tareas con su status
    List,
    /// Detalle de una tarea
    Show {
        #[arg(value_name = "TASK_ID")]
        id: LocalId,
    },
}

fn print_registration(registration: &HandlerRegistration) {
    println!("{} ({})", registration.name, registration.identifier);
    for line in registration.documentation().lines() {
        println!("    {}", line);
    }
    let services = registration.required_services();
    if services.is_empty() {
        println!("  servicios requeridos: (ninguno)");
    } else {
        println!("  servicios requeridos:");
        for service in services {
            println!(
                "    - {} [{}]: {}",
                service.alias, service.service_type, service.description
            );
        }
    }
}

fn print_task(task: &ExternalTask) {
    println!("Tarea {}:", task.id);
    println!("  topic: {}", task.topic_name);
    println!("  task_id: {}", task.task_id);
    println!("  worker_id: {}", task.worker_id);
    println!("  estado: {}", task.status);
    if let Some(ref instance) = task.process_instance_id {
        println!("  process_instance_id: {}", instance);
    }
    if let Some(priority) = task.priority {
        println!("  prioridad: {}", priority);
    }
    match task.lock_expires_at {
        Some(at) => println!("  lock hasta: {}", at),
        None => println!("  lock hasta: (sin lock)"),
    }
    if !task.variables.is_empty() {
        println!("  variables:");
        for (name, value) in task.flat_variables() {
            println!("    {} = {}", name, value);
        }
    }
    if !task.result_variables.is_empty() {
        println!("  resultado:");
        for (name, value) in &task.result_variables {
            println!("    {} = {}", name, value);
        }
    }
    if !task.execution_error.is_empty() {
        println!("  error de ejecución:");
        for line in task.execution_error.lines() {
            println!("    {}", line);
        }
    }
    if let Some(ref body) = task.engine_error {
        println!("  error del engine: {}", body);
    }
    if !task.history.is_empty() {
        println!("  historial:");
        for entry in &task.history {
            println!("    {} {}", entry.at, entry.status);
        }
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let app = App::bootstrap(Config::from_env()).await?;

    match cli.command {
        Commands::ExecuteTask { id, force } => {
            if force {
                let task = app.pipeline.force_reset(id).await?;
                println!("Tarea {} ({}) reiniciada a {}", task.id, task, task.status);
            }

            match app.pipeline.execute_and_complete(id).await {
                Ok(status) => println!("Tarea {} terminó en {}", id, status),
                Err(e) => {
                    eprintln!("Error ejecutando tarea {}: {}", id, e);
                    if let Some(task) = app.store.load(id).await? {
                        eprintln!("  estado: {}", task.status);
                    }
                    std::process::exit(1);
                }
            }
        }

        Commands::ExecuteTasks { max_tasks } => {
            let report = app.pipeline.run_batch(max_tasks).await?;
            println!("Lote del worker {}:", report.worker_id);
            println!("  fetch-and-lock: {} tarea(s)", report.fetched);
            println!(
                "  ejecución     : ok={}, fallidas={}, omitidas={}",
                report.executed, report.execution_failed, report.skipped
            );
            println!(
                "  complete      : ok={}, fallidas={}",
                report.completed, report.completion_failed
            );
        }

        Commands::FetchAndLock { max_tasks } => {
            let outcome = app.pipeline.fetch_and_lock(max_tasks).await?;
            println!(
                "Worker {} bloqueó {} tarea(s)",
                outcome.worker_id, outcome.count
            );
            for task in outcome.tasks {
                println!("  - id={} {}", task.id, task);
            }
        }

        Commands::ShowTaskRegistry => {
            let registrations = app.registry.registrations();
            if registrations.is_empty() {
                println!("No hay handlers registrados.");
            }
            for registration in registrations {
                print_registration(&registration);
                println!();
            }
        }

        Commands::Mappings { command } => match command {
            MappingCommands::List => {
                let mappings = app.store.mappings().await?;
                if mappings.is_empty() {
                    println!("No hay mappings configurados.");
                }
                for mapping in mappings {
                    let estado = if mapping.active { "activo" } else { "inactivo" };
                    println!("{} -> {} ({})", mapping.topic_name, mapping.callback, estado);
                    if !mapping.default_services.is_empty() {
                        println!("  servicios: {}", mapping.default_services.join(", "));
                    }
                }
            }
            MappingCommands::Set {
                topic,
                callback,
                inactive,
                services,
            } => {
                let mut mapping = TaskMapping::new(&topic, &callback);
                mapping.active = !inactive;
                mapping.default_services = services;

                if let Err(e) = validate_mapping(&mapping, &app.registry) {
                    bail!("mapping inválido para '{}': {}", topic, e);
                }
                app.store.upsert_mapping(mapping).await?;
                println!("Mapping guardado: {} -> {}", topic, callback);
            }
        },

        Commands::Tasks { command } => match command {
            TaskCommands::List => {
                let tasks = app.store.list().await?;
                if tasks.is_empty() {
                    println!("No hay tareas guardadas.");
                }
                for task in tasks {
                    println!("{:>5}  {:<12} {}", task.id, task.status.as_str(), task);
                }
            }
            TaskCommands::Show { id } => match app.store.load(id).await? {
                Some(task) => print_task(&task),
                None => println!("No se encontró la tarea con id {id}"),
            },
        },
    }

    Ok(())
}
