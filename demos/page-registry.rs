//! This example builds a page registry from every process of a raw ARM64
//! Linux memory snapshot and prints what it learned.
//!
//! Usage: `page-registry <snapshot> [profile name | profile.json] [kernel root]`

mod common;

use vmsnap::{
    AccessContext,
    utils::{
        Representation, hexdump,
        registry::{ContentType, PageRegistry, RegistryConfig, linux},
    },
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    common::init_logging();

    let args = common::parse_args()?;
    let core = common::open_snapshot(&args)?;
    let scanner = common::create_scanner(&core, &args)?;

    let init = match scanner.find_init_task() {
        Some(init) => init,
        None => return Err("init_task not found".into()),
    };

    let tasks = scanner.walk_task_list(&init);
    tracing::info!(count = tasks.len(), "processes found");

    let mut registry = PageRegistry::new(RegistryConfig::for_layout(core.layout()));

    let recorded = linux::populate_all(&mut registry, &scanner, &tasks);
    let labelled = tasks
        .iter()
        .filter(|task| linux::mark_task(&mut registry, &scanner, task))
        .count();

    tracing::info!(recorded, labelled, "registry populated");

    // Statistics.
    let stats = registry.stats();
    println!("Pages:     {}", stats.total_pages);
    println!("Mappings:  {}", stats.total_mappings);
    println!("Shared:    {}", stats.shared_pages);
    println!("Kernel:    {}", stats.kernel_pages);
    println!("Processes: {}", stats.processes);
    println!("Dropped:   {}", stats.dropped);
    println!();

    for content in ContentType::ALL {
        println!("  {:<14} {}", content.as_str(), stats.pages_with(content));
    }

    // The most shared pages.
    let mut shared: Vec<_> = registry.shared_pages().collect();
    shared.sort_by_key(|page| std::cmp::Reverse(page.mappings().len()));

    println!();
    println!("Most shared pages:");
    for page in shared.iter().take(5) {
        print!("{}", page.summary());
    }

    // A compacted view over code pages.
    let view = registry.compacted_view(|page| page.content() == ContentType::Code);
    println!();
    println!(
        "Code view: {} pages, {} bytes",
        view.len(),
        view.size()
    );

    if let Some(pa) = view.offset_to_pa(0) {
        println!("{}", hexdump(&core, AccessContext::direct(pa), 64, Representation::U8)?);
    }

    Ok(())
}
