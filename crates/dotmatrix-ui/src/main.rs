mod audio;

use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use dotmatrix_core::diagnostics::{Level, LogSink, try_set_log_sink};
use dotmatrix_core::joypad;
use dotmatrix_core::machine::{CrashReason, Machine};
use dotmatrix_core::{SCREEN_HEIGHT, SCREEN_WIDTH};
use pixels::{Pixels, SurfaceTexture};
use winit::application::ApplicationHandler;
use winit::event::{ElementState, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Window, WindowId};

/// Hardware field rate; `--fps` only caps presentation below this.
const GB_FPS: f64 = 59.7275;

/// DMG green ramp, light to dark, one RGBA entry per 2-bit shade.
const SHADES: [[u8; 4]; 4] = [
    [0x9B, 0xBC, 0x0F, 0xFF],
    [0x8B, 0xAC, 0x0F, 0xFF],
    [0x30, 0x62, 0x30, 0xFF],
    [0x0F, 0x38, 0x0F, 0xFF],
];

#[derive(Parser)]
#[command(name = "dotmatrix", about = "DMG-01 Game Boy emulator")]
struct Args {
    /// Path to a .gb ROM image
    rom: PathBuf,

    /// Integer window scale
    #[arg(long, default_value_t = 3)]
    scale: u32,

    /// Presentation frame-rate cap
    #[arg(long, default_value_t = 60)]
    fps: u32,

    /// Run without a window or audio
    #[arg(long)]
    headless: bool,

    /// Number of frames to run in headless mode
    #[arg(long, default_value_t = 120)]
    frames: u32,

    /// Verbose logging (core trace included)
    #[arg(long)]
    debug: bool,
}

/// Forwards core diagnostics into the `log` ecosystem.
struct CoreLogBridge;

impl LogSink for CoreLogBridge {
    fn log(&self, level: Level, target: &'static str, args: fmt::Arguments) {
        let level = match level {
            Level::Trace => log::Level::Trace,
            Level::Info => log::Level::Info,
            Level::Warn => log::Level::Warn,
        };
        log::log!(target: target, level, "{args}");
    }
}

fn save_path(rom: &PathBuf) -> PathBuf {
    let mut p = rom.clone();
    p.set_extension("sav");
    p
}

/// Dump battery-backed RAM next to the ROM on clean exit.
fn persist_battery_ram(machine: &Machine, rom: &PathBuf) {
    let Some(cart) = machine.cartridge() else {
        return;
    };
    if !cart.has_battery() || cart.ram.is_empty() {
        return;
    }
    let path = save_path(rom);
    if let Err(e) = std::fs::write(&path, &cart.ram) {
        log::error!("failed to write {}: {e}", path.display());
    } else {
        log::info!("saved cartridge RAM to {}", path.display());
    }
}

fn key_to_button(key: KeyCode) -> Option<u8> {
    match key {
        KeyCode::KeyZ => Some(joypad::BTN_A),
        KeyCode::KeyX => Some(joypad::BTN_B),
        KeyCode::Backspace | KeyCode::ShiftRight => Some(joypad::BTN_SELECT),
        KeyCode::Enter => Some(joypad::BTN_START),
        KeyCode::ArrowRight => Some(joypad::BTN_RIGHT),
        KeyCode::ArrowLeft => Some(joypad::BTN_LEFT),
        KeyCode::ArrowUp => Some(joypad::BTN_UP),
        KeyCode::ArrowDown => Some(joypad::BTN_DOWN),
        _ => None,
    }
}

struct App {
    machine: Machine,
    rom_path: PathBuf,
    scale: u32,
    frame_time: Duration,
    next_frame: Instant,
    buttons: u8,
    window: Option<Arc<Window>>,
    pixels: Option<Pixels<'static>>,
    _audio: Option<cpal::Stream>,
    exit: Option<ExitCode>,
}

impl App {
    fn render_frame(&mut self, event_loop: &ActiveEventLoop) {
        self.machine.set_buttons(self.buttons);
        self.machine.run_frame();

        if let Some(reason) = self.machine.crash_reason() {
            report_crash(reason);
            self.exit = Some(ExitCode::from(2));
            event_loop.exit();
            return;
        }

        if let Some(pixels) = self.pixels.as_mut() {
            let fb = &self.machine.bus.ppu.framebuffer;
            for (dst, &shade) in pixels.frame_mut().chunks_exact_mut(4).zip(fb.iter()) {
                dst.copy_from_slice(&SHADES[shade as usize]);
            }
            if let Err(e) = pixels.render() {
                log::error!("render failed: {e}");
                event_loop.exit();
            }
        }

        self.next_frame += self.frame_time;
        let now = Instant::now();
        if self.next_frame < now {
            // Fell behind; drop the debt instead of racing to catch up.
            self.next_frame = now + self.frame_time;
        }
        event_loop.set_control_flow(ControlFlow::WaitUntil(self.next_frame));
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        let size = winit::dpi::LogicalSize::new(
            (SCREEN_WIDTH as u32 * self.scale) as f64,
            (SCREEN_HEIGHT as u32 * self.scale) as f64,
        );
        let attrs = Window::default_attributes()
            .with_title("dotmatrix")
            .with_inner_size(size);
        let window = Arc::new(
            event_loop
                .create_window(attrs)
                .expect("failed to create window"),
        );
        let inner = window.inner_size();
        let surface = SurfaceTexture::new(inner.width, inner.height, Arc::clone(&window));
        let pixels = Pixels::new(SCREEN_WIDTH as u32, SCREEN_HEIGHT as u32, surface)
            .expect("failed to create pixel surface");
        self.window = Some(window);
        self.pixels = Some(pixels);
        self.next_frame = Instant::now() + self.frame_time;
        event_loop.set_control_flow(ControlFlow::WaitUntil(self.next_frame));
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => event_loop.exit(),
            WindowEvent::Resized(size) => {
                if let Some(pixels) = self.pixels.as_mut()
                    && pixels.resize_surface(size.width, size.height).is_err()
                {
                    event_loop.exit();
                }
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if let PhysicalKey::Code(code) = event.physical_key {
                    if code == KeyCode::Escape {
                        event_loop.exit();
                        return;
                    }
                    if let Some(bit) = key_to_button(code) {
                        match event.state {
                            ElementState::Pressed => self.buttons |= bit,
                            ElementState::Released => self.buttons &= !bit,
                        }
                    }
                }
            }
            WindowEvent::RedrawRequested => self.render_frame(event_loop),
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window
            && Instant::now() >= self.next_frame
        {
            window.request_redraw();
        }
    }
}

fn report_crash(reason: CrashReason) {
    match reason {
        CrashReason::IllegalOpcode { opcode, pc } => {
            log::error!("CPU locked: illegal opcode {opcode:02X} at {pc:04X}");
        }
    }
}

fn run_headless(machine: &mut Machine, frames: u32) -> Option<CrashReason> {
    for _ in 0..frames {
        machine.run_frame();
        if let Some(reason) = machine.crash_reason() {
            return Some(reason);
        }
    }
    None
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
    let _ = try_set_log_sink(Box::new(CoreLogBridge));

    let rom = match std::fs::read(&args.rom) {
        Ok(rom) => rom,
        Err(e) => {
            log::error!("cannot read {}: {e}", args.rom.display());
            return ExitCode::from(1);
        }
    };

    let mut machine = Machine::new();
    if let Err(e) = machine.load_rom(rom) {
        log::error!("cannot load {}: {e}", args.rom.display());
        return ExitCode::from(1);
    }

    // Seed battery RAM from an earlier run.
    if let Ok(bytes) = std::fs::read(save_path(&args.rom))
        && let Some(cart) = machine.cartridge_mut()
    {
        cart.load_ram(&bytes);
    }

    if args.headless {
        if let Some(reason) = run_headless(&mut machine, args.frames) {
            report_crash(reason);
            return ExitCode::from(2);
        }
        persist_battery_ram(&machine, &args.rom);
        return ExitCode::SUCCESS;
    }

    let fps = f64::from(args.fps.clamp(1, 1000)).min(GB_FPS);
    let mut app = App {
        rom_path: args.rom.clone(),
        scale: args.scale.clamp(1, 8),
        frame_time: Duration::from_secs_f64(1.0 / fps),
        next_frame: Instant::now(),
        buttons: 0,
        window: None,
        pixels: None,
        _audio: audio::start_stream(&mut machine),
        machine,
        exit: None,
    };

    let event_loop = match EventLoop::new() {
        Ok(el) => el,
        Err(e) => {
            log::error!("cannot create event loop: {e}");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = event_loop.run_app(&mut app) {
        log::error!("event loop failed: {e}");
        return ExitCode::from(1);
    }

    if let Some(code) = app.exit {
        return code;
    }
    persist_battery_ram(&app.machine, &app.rom_path);
    ExitCode::SUCCESS
}
