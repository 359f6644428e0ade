//! This example lists the processes of a raw ARM64 Linux memory snapshot.
//!
//! Usage: `process-list <snapshot> [profile name | profile.json] [kernel root]`

mod common;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    common::init_logging();

    let args = common::parse_args()?;
    let core = common::open_snapshot(&args)?;
    let scanner = common::create_scanner(&core, &args)?;

    // Walk the process list from `init_task`. Without it, fall back to a
    // full scan of the image.
    let tasks = match scanner.find_init_task() {
        Some(init) => {
            tracing::info!(pa = %init.pa, "init_task found");
            scanner.walk_task_list(&init)
        }
        None => {
            tracing::warn!("init_task not found, scanning the image");
            scanner.enumerate_tasks(scanner.config().task_list_limit)
        }
    };

    println!("{:>7}  {:<16}  {:<18}  {:<18}  root", "pid", "name", "task_struct", "mm");

    for task in &tasks {
        let root = match scanner.process_root(task) {
            Some(root) => root.to_string(),
            None => String::from("-"),
        };

        println!(
            "{:>7}  {:<16}  {}  {}  {}",
            task.pid, task.name, task.pa, task.mm, root
        );
    }

    println!("{} processes", tasks.len());

    if tasks.is_empty() {
        let candidates = scanner.find_table_candidates();
        println!("No processes; {} page table candidates:", candidates.len());

        for pa in candidates {
            println!("  {pa}");
        }
    }

    // Print the threads and memory map of the first user process.
    if let Some(task) = tasks.iter().find(|task| !task.is_kernel_thread()) {
        println!();
        println!("Threads of {} ({}):", task.name, task.pid);

        for thread in scanner.threads(task) {
            println!("  {:>7}  {}", thread.pid, thread.name);
        }

        println!();
        println!("Regions of {} ({}):", task.name, task.pid);

        for region in scanner.regions(task) {
            println!(
                "  {}-{} {} {:<8} {}",
                region.start,
                region.end,
                region.access(),
                region.kind.as_str(),
                if region.file_backed { "file" } else { "" }
            );
        }
    }

    Ok(())
}
