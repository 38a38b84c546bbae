use std::cell::RefCell;
use std::process::ExitCode;
use std::rc::Rc;
use std::time::Instant;

use log::{error, info, warn};
use memory::{
    ClientStateId, GpuMemoryConfig, GpuMemoryManager, MemoryPool, MemoryTrackerKey,
    TrackingGroupId,
};
use owl_gpu::{
    ipc, ChannelHandle, EstablishChannelRequest, GpuContextClient, GpuProcessHostRegistry,
    GpuProcessKind, IpcStatsReporter, MessageSink,
};
use util::{mib, IdGenerator, ProcessId};

const TAB_COUNT: u64 = 12;
const SWITCHES: usize = 20;

struct Tab {
    client: Rc<GpuContextClient>,
    group: TrackingGroupId,
    state: ClientStateId,
    bytes: u64,
}

fn main() -> ExitCode {
    env_logger::init();

    let config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let sink: Rc<dyn MessageSink> = Rc::new(|json: String| println!("{json}"));
    let reporter = {
        let sink = Rc::clone(&sink);
        IpcStatsReporter::new(move |json: String| sink.send(json))
    };
    let manager = GpuMemoryManager::new(config).with_stats_reporter(Rc::new(reporter));

    let mut registry = GpuProcessHostRegistry::new();
    let routes = IdGenerator::default();
    let mut tabs = Vec::new();
    for renderer in 0..TAB_COUNT {
        match open_tab(&manager, &mut registry, &routes, &sink, renderer) {
            Ok(tab) => tabs.push(tab),
            Err(err) => warn!("tab {renderer} not opened: {err}"),
        }
    }

    let mut visible = 0;
    for step in 0..SWITCHES {
        let next = (step * 5 + 3) % tabs.len().max(1);
        if let Err(err) = switch_tab(&manager, &tabs, visible, next) {
            warn!("tab switch failed: {err}");
        }
        visible = next;
        if let Some(tab) = tabs.get_mut(visible) {
            grow(&manager, tab, mib(6));
        }
        drain(&manager);
    }

    for tab in tabs.drain(..) {
        close_tab(&manager, tab);
    }
    drain(&manager);

    if let Err(err) = ipc::handle_incoming(
        &manager,
        sink.as_ref(),
        r#"{"type":"gpu.get_video_memory_usage"}"#,
    ) {
        warn!("{err}");
    }
    info!(
        "session done: peak {} bytes, {} bytes still tracked",
        manager.bytes_allocated_historical_max(),
        manager.current_usage()
    );
    ExitCode::SUCCESS
}

fn load_config() -> Result<GpuMemoryConfig, memory::ConfigError> {
    let config = match std::env::args().nth(1) {
        Some(path) => GpuMemoryConfig::from_json_file(path)?,
        None => GpuMemoryConfig::default(),
    };
    config.with_env_overrides()
}

fn open_tab(
    manager: &GpuMemoryManager,
    registry: &mut GpuProcessHostRegistry,
    routes: &IdGenerator,
    sink: &Rc<dyn MessageSink>,
    renderer: u64,
) -> Result<Tab, Box<dyn std::error::Error>> {
    let route = routes.next();
    let established: Rc<RefCell<Option<ChannelHandle>>> = Rc::new(RefCell::new(None));
    let mut request = {
        let established = Rc::clone(&established);
        EstablishChannelRequest::new(route, GpuProcessKind::Sandboxed, move |outcome| {
            match outcome {
                Ok(handle) => *established.borrow_mut() = Some(handle),
                Err(err) => warn!("channel for route {route} failed: {err}"),
            }
        })
    };
    let host = request.dispatch(registry)?;
    registry.on_process_launched(host, ProcessId::current());
    request.on_channel_established(ChannelHandle {
        host,
        client_id: route,
    })?;
    request.finish()?;
    if established.borrow().is_none() {
        return Err(format!("no channel for route {route}").into());
    }

    let tracker = MemoryTrackerKey::new(route);
    let group = manager.create_tracking_group(ProcessId::new(1000 + renderer as u32), tracker)?;
    let client = Rc::new(GpuContextClient::new(route, tracker, Rc::clone(sink)));
    let state = manager.create_client_state(&client, true, renderer == 0)?;
    Ok(Tab {
        client,
        group,
        state,
        bytes: 0,
    })
}

fn switch_tab(
    manager: &GpuMemoryManager,
    tabs: &[Tab],
    from: usize,
    to: usize,
) -> memory::error::Result<()> {
    if from == to {
        return Ok(());
    }
    if let Some(tab) = tabs.get(to) {
        manager.set_client_visible(tab.state, true)?;
    }
    if let Some(tab) = tabs.get(from) {
        manager.set_client_visible(tab.state, false)?;
    }
    Ok(())
}

fn grow(manager: &GpuMemoryManager, tab: &mut Tab, delta: u64) {
    let limit = tab
        .client
        .allocation()
        .map(|allocation| allocation.bytes_limit_when_visible)
        .unwrap_or(0);
    let new_size = (tab.bytes + delta).min(limit);
    if let Err(err) =
        manager.track_memory_allocated_change(tab.group, tab.bytes, new_size, MemoryPool::Managed)
    {
        warn!("route {}: {err}", tab.client.route());
        return;
    }
    tab.bytes = new_size;
}

fn close_tab(manager: &GpuMemoryManager, tab: Tab) {
    let result = manager
        .destroy_client_state(tab.state)
        .and_then(|_| manager.destroy_tracking_group(tab.group));
    if let Err(err) = result {
        warn!("route {}: {err}", tab.client.route());
    }
}

/// Runs scheduled passes until the manager is idle.
fn drain(manager: &GpuMemoryManager) {
    while let Some(deadline) = manager.next_wakeup(Instant::now()) {
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
        manager.poll(Instant::now());
    }
}
