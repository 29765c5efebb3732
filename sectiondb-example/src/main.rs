use chrono::{DateTime, Utc};
use sectiondb::{
    BindingOptions, DeleteEditor, EditAction, Identifiable, IndexPath, Item, KeyStrategy,
    ListBinding, ListControl, Patch, QueueContext, SegmentedBinding, Snapshot, Store,
    ViewDefinition,
};
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const COLORS: [&str; 3] = ["red", "green", "blue"];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Event {
    id: String,
    title: String,
    color: String,
    date: DateTime<Utc>,
}

impl Identifiable for Event {
    const COLLECTION: &'static str = "events";

    fn key(&self) -> String {
        self.id.clone()
    }
}

/// Prints what a list widget for one color would be told to do.
struct ConsoleList {
    color: &'static str,
}

impl ListControl<Event> for ConsoleList {
    fn apply_patch(&mut self, patch: &Patch, new: &Snapshot<Event>) -> sectiondb::Result<()> {
        println!("[{}] {} op(s), {} row(s)", self.color, patch.len(), new.len());
        for op in patch.iter() {
            println!("[{}]   {op}", self.color);
        }
        Ok(())
    }

    fn reload_data(&mut self, snapshot: &Snapshot<Event>) {
        println!("[{}] reload, {} row(s)", self.color, snapshot.len());
    }
}

/// Events of one color, newest first.
fn color_view(color: &'static str) -> ViewDefinition<Event> {
    ViewDefinition::new(color, [Event::COLLECTION])
        .with_grouping(move |item: &Item<Event>| {
            (item.value.color == color).then(|| color.to_string())
        })
        .with_sorting(|_, a: &Item<Event>, b: &Item<Event>| a.value.date.cmp(&b.value.date))
        .with_reversed_group(color)
}

fn main() {
    env_logger::init();

    let path = std::env::var("SECTIONDB_EXAMPLE_DB").unwrap_or_else(|_| "events.sqlite".to_string());
    if let Err(e) = run(&path) {
        eprintln!("ERROR:{e}");
        std::process::exit(1);
    }
}

fn run(path: &str) -> sectiondb::Result<()> {
    log::info!("Opening store at: {path}");
    let store = Store::open(path)?;
    let main_queue = QueueContext::new();

    let segments = COLORS
        .iter()
        .map(|&color| {
            ListBinding::bind(
                color,
                &store,
                color_view(color),
                ConsoleList { color },
                BindingOptions::default()
                    .with_title(color.to_uppercase())
                    .with_context(main_queue.clone())
                    .with_editor(DeleteEditor),
            )
        })
        .collect::<sectiondb::Result<Vec<_>>>()?;
    let mut events = SegmentedBinding::new("events", segments, 0)?.with_selection_handler(
        |index, binding| println!("Selected segment {index} ({})", binding.title()),
    );

    print_help(&events);
    let stdin = io::stdin();
    loop {
        main_queue.run_pending();
        print!("{}> ", events.selected().title());
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let mut words = line.split_whitespace();
        match words.next() {
            Some("add") => {
                let title = words.collect::<Vec<_>>().join(" ");
                let event = Event {
                    id: KeyStrategy::Ulid.generate(),
                    title: if title.is_empty() { "Untitled".to_string() } else { title },
                    color: COLORS[events.selected_index()].to_string(),
                    date: Utc::now(),
                };
                write_and_wait(&store, &main_queue, move |txn| txn.put(&event));
            }
            Some("delete") => match words.next().and_then(|w| w.parse::<usize>().ok()) {
                Some(row) => {
                    let path = IndexPath::new(0, row);
                    if events.can_edit(path) {
                        events.commit_edit(EditAction::Delete, path)?;
                    } else {
                        println!("No row {row}");
                    }
                }
                None => println!("Usage: delete <row>"),
            },
            Some("clear") => {
                write_and_wait(&store, &main_queue, |txn| {
                    txn.remove_all(Event::COLLECTION).map(|_| ())
                });
            }
            Some("select") => match words.next().and_then(|w| w.parse::<usize>().ok()) {
                Some(index) => {
                    if let Err(e) = events.select(index) {
                        println!("{e}");
                    }
                }
                None => println!("Usage: select <segment>"),
            },
            Some("list") => print_rows(&events),
            Some("quit") | Some("exit") => break,
            Some(_) => print_help(&events),
            None => {}
        }
    }

    Ok(())
}

/// Queue a write on the store's writer thread and pump the main queue until
/// its completion has run there.
fn write_and_wait<B>(store: &Store, main_queue: &Arc<QueueContext>, body: B)
where
    B: FnOnce(&mut sectiondb::WriteTransaction<'_>) -> sectiondb::Result<()> + Send + 'static,
{
    let done = Arc::new(AtomicBool::new(false));
    let finished = done.clone();
    store.async_write(body, main_queue.clone(), move |result| {
        if let Err(e) = result {
            println!("Write failed: {e}");
        }
        finished.store(true, Ordering::SeqCst);
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while !done.load(Ordering::SeqCst) && Instant::now() < deadline {
        main_queue.run_pending();
        std::thread::sleep(Duration::from_millis(5));
    }
    main_queue.run_pending();
}

fn print_rows(events: &SegmentedBinding<Event>) {
    let snapshot = events.snapshot();
    if snapshot.is_empty() {
        println!("(no events)");
        return;
    }
    for (index, section) in snapshot.sections.iter().enumerate() {
        println!("{}", events.header_title(index).unwrap_or_else(|| section.group.clone()));
        for (row, item) in section.items.iter().enumerate() {
            println!(
                "  {row}: {} ({})",
                item.value.title,
                item.value.date.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
}

fn print_help(events: &SegmentedBinding<Event>) {
    println!("Segments: {}", events.titles().join(" | "));
    println!("Commands: add <title>, delete <row>, clear, select <segment>, list, quit");
}
