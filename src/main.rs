use {
    infinity_mirror::{
        config::{MirrorConfig, CONFIG_FILENAME},
        renderer::Renderer,
    },
    log::{error, info},
    std::{env::args, time::Duration},
    winit::{
        application::ApplicationHandler,
        dpi::PhysicalSize,
        error::EventLoopError,
        event::{ElementState, KeyEvent, WindowEvent},
        event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
        keyboard::{Key, NamedKey},
        window::{Window, WindowId},
    },
};

fn main() -> Result<(), EventLoopError> {
    pretty_env_logger::init();

    let config_path = args().nth(1).unwrap_or_else(|| CONFIG_FILENAME.to_owned());
    let config = MirrorConfig::read(config_path);

    EventLoop::new()?.run_app(&mut Application {
        config,
        renderer: None,
        window: None,
    })
}

struct Application {
    config: MirrorConfig,

    // Dropped before the window it presents to
    renderer: Option<Renderer>,

    window: Option<Window>,
}

impl Application {
    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(renderer) = self.renderer.take() {
            match Renderer::stop(renderer) {
                Ok(report) => info!(
                    "Dispatched {} frames, presented {} frames",
                    report.dispatch.total(),
                    report.present.total()
                ),
                Err(err) => error!("frame loop failed: {err}"),
            }
        }

        event_loop.exit();
    }
}

impl ApplicationHandler for Application {
    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self
            .renderer
            .as_ref()
            .is_some_and(|renderer| !Renderer::is_running(renderer))
        {
            self.shutdown(event_loop);
        }

        // Frames are produced by the renderer threads; this loop only watches for shutdown
        event_loop.set_control_flow(ControlFlow::wait_duration(Duration::from_millis(100)));
    }

    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = Window::default_attributes()
            .with_title(self.config.title.as_str())
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height))
            .with_resizable(false);
        let window = match event_loop.create_window(window_attributes) {
            Ok(window) => window,
            Err(err) => {
                error!("unable to create window: {err}");
                event_loop.exit();

                return;
            }
        };

        match Renderer::setup(&window, &self.config) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(_) => {
                error!("Failed setup, exiting application");
                event_loop.exit();
            }
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested
            | WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        logical_key: Key::Named(NamedKey::Escape),
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => self.shutdown(event_loop),
            _ => (),
        }
    }
}
