use droidstrap::{bridge::DexSource, prelude::*};
use tracing::{debug, error, info, warn};

use crate::app::RunOptions;

pub fn run(options: &RunOptions) -> anyhow::Result<()> {
    let config = match configure(options) {
        Ok(config) => config,
        Err(failure) => fail(&failure),
    };

    let runtime = match Bootstrap::new(config).run() {
        Ok(runtime) => runtime,
        Err(failure) => fail(&failure),
    };

    let session = runtime.session();
    let surface = session.surface();
    let screen = session.display();
    info!(
        vm = format_args!("{:#x}", runtime.vm().identity()),
        singleton = format_args!("{:#x}", runtime.receipt().address),
        "handles"
    );
    info!(
        width = surface.width(),
        height = surface.height(),
        rotation = screen.rotation,
        "surface created"
    );

    let input = TouchInput::discover(
        surface.width() as f32,
        surface.height() as f32,
        screen.rotation,
    );
    if input.is_empty() {
        warn!("no touch device, nothing to present");
        return Ok(());
    }
    info!(devices = input.device_count(), "starting present loop");

    let mut present = PacedLoop::new(input, options.fps);
    if let Err(error) = drive(&runtime, &mut present, options.frames) {
        fail(&Failure::new(Stage::Present, error));
    }

    info!(frames = present.frames(), "present loop stopped");
    Ok(())
}

fn configure(options: &RunOptions) -> std::result::Result<BootstrapConfig, Failure> {
    let mut config = BootstrapConfig::from_env();

    if let Some(path) = &options.offsets {
        config = config.with_offsets(OffsetSource::File(path.clone()));
    }
    if let Some(path) = &options.dex {
        config = config.with_dex(DexSource::File(path.clone()));
    }
    if let Some(level) = &options.api_level {
        let version =
            PlatformVersion::from_api_level(level).map_err(|e| Failure::new(Stage::Patch, e))?;
        config = config.with_platform(version);
    }
    if options.require_root {
        config = config.with_root_required();
    }
    for option in &options.vm_options {
        config = config.with_vm_option(option.as_str());
    }
    if let Some(library) = &options.vm_library {
        config = config.with_vm_library(library.as_str());
    }
    if let Some(provider) = &options.jni_provider {
        config = config.with_jni_provider(provider.as_str());
    }

    Ok(config)
}

fn drive(runtime: &Runtime, present: &mut PacedLoop, limit: Option<u64>) -> droidstrap::Result<()> {
    let surface = runtime.session().surface();
    let mut presented = 0u64;

    while !crate::cancelled() && limit.map_or(true, |limit| presented < limit) {
        if present.input().is_empty() {
            warn!("every touch device is gone");
            break;
        }

        let frame = present.begin_frame(surface)?;

        let mut delivered = 0usize;
        for event in present.pump_input_events() {
            // Injection is best effort; the helper may reject events it cannot map
            if let Err(error) = runtime.inject(&event) {
                debug!(%error, "touch not injected");
            }
            delivered += 1;
        }
        if delivered > 0 {
            debug!(events = delivered, "touches forwarded");
        }

        present.end_frame(frame)?;
        presented += 1;
    }

    Ok(())
}

fn fail(failure: &Failure) -> ! {
    error!("{failure}");
    std::process::exit(1)
}
