//! Live comparison of the particle density estimate (left) with the analytic
//! mixture density (right).
//!
//! Controls:
//!   Space = Pause/Resume
//!   Up/Down = dt x1.25 / /1.25
//!   +/- = Add/remove a component
//!   Tab = Select next component
//!   W/A/S/D = Move selected component
//!   [/] = Narrow/widen selected component
//!   P = Toggle particles/estimate on the left
//!   C = Restart particles from the grid
//!   R = Reset view
//!   Drag = Pan, Ctrl+Wheel = Zoom
//!
//! Run with: cargo run --release --features viz --bin langevin-viz -- [config.json] [--gpu]

use anyhow::Context;
use glam::Vec2;
use iced::keyboard;
use iced::mouse;
use iced::widget::{Column, Text, image};
use iced::{ContentFit, Element, Event, Length, Point, Size, Subscription, Task, event, window};
use langevin::noise::random_seed;
use langevin::{Config, LeftPane, Session, ViewState, create_backend};
use std::cell::Cell;

/// Height reserved below the image for the status lines
const STATUS_HEIGHT: f32 = 48.0;

/// Multiplicative dt change per key press
const DT_STEP: f32 = 1.25;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut config_path = None;
    let mut gpu = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--gpu" => gpu = true,
            path => config_path = Some(path.to_string()),
        }
    }
    let mut config = match &config_path {
        Some(path) => Config::load(path).with_context(|| format!("loading {path}"))?,
        None => Config::default(),
    };
    config.validate().context("invalid config")?;

    let backend = create_backend(&config, gpu).context("creating backend")?;
    let window_size = Size::new(config.window.width as f32, config.window.height as f32);
    let session = Cell::new(Some(Session::new(&config, backend)));

    iced::application(
        move || App::new(session.take().expect("application booted twice"), window_size),
        update,
        view,
    )
    .subscription(subscription)
    .title("Langevin - estimate vs analytic density")
    .window_size(window_size)
    .run()?;
    Ok(())
}

struct App {
    session: Session,
    frame: image::Handle,
    /// Surface size of `frame`; the image is drawn at exactly this size so
    /// cursor positions are surface pixels
    frame_size: Size,
    window: Size,
    selected: usize,
    cursor: Option<Point>,
    dragging: bool,
    ctrl: bool,
}

impl App {
    fn new(session: Session, window: Size) -> Self {
        Self {
            session,
            frame: image::Handle::from_rgba(1, 1, vec![0u8, 0, 0, 255]),
            frame_size: Size::new(1.0, 1.0),
            window,
            selected: 0,
            cursor: None,
            dragging: false,
            ctrl: false,
        }
    }

    fn render_size(&self) -> (u32, u32) {
        (
            self.window.width.max(2.0) as u32,
            (self.window.height - STATUS_HEIGHT).max(1.0) as u32,
        )
    }

    fn move_selected(&mut self, dir: Vec2) {
        let step = 0.02 * self.session.view().scale;
        let index = self.selected;
        self.session.edit_mixture(|m| {
            if let Some(g) = m.component(index).copied() {
                m.set_mean(index, g.mean() + dir * step);
            }
        });
    }

    fn scale_selected(&mut self, factor: f32) {
        let index = self.selected;
        self.session.edit_mixture(|m| {
            if let Some(g) = m.component(index).copied() {
                m.set_sigma(index, g.sigma() * factor);
            }
        });
    }

    fn change_count(&mut self, delta: isize) {
        let count = self.session.mixture().count().saturating_add_signed(delta);
        self.session.edit_mixture(|m| m.set_count(count));
        self.selected = self.selected.min(self.session.mixture().count() - 1);
    }
}

#[derive(Debug, Clone)]
enum Message {
    Tick,
    Event(Event),
}

fn update(app: &mut App, message: Message) -> Task<Message> {
    match message {
        Message::Tick => {
            let (width, height) = app.render_size();
            match app.session.frame(width, height) {
                Ok(surface) => {
                    app.frame_size = Size::new(surface.width() as f32, surface.height() as f32);
                    app.frame = image::Handle::from_rgba(
                        surface.width(),
                        surface.height(),
                        surface.as_bytes().to_vec(),
                    );
                }
                Err(err) => {
                    log::error!("frame failed: {err}");
                    return iced::exit();
                }
            }
        }
        Message::Event(event) => handle_event(app, event),
    }
    Task::none()
}

fn handle_event(app: &mut App, event: Event) {
    match event {
        Event::Keyboard(keyboard::Event::KeyPressed { key, .. }) => match key.as_ref() {
            keyboard::Key::Named(keyboard::key::Named::Space) => {
                let paused = app.session.paused();
                app.session.set_paused(!paused);
            }
            keyboard::Key::Named(keyboard::key::Named::ArrowUp) => app.session.scale_dt(DT_STEP),
            keyboard::Key::Named(keyboard::key::Named::ArrowDown) => app.session.scale_dt(1.0 / DT_STEP),
            keyboard::Key::Named(keyboard::key::Named::Tab) => {
                app.selected = (app.selected + 1) % app.session.mixture().count();
            }
            keyboard::Key::Character("=") | keyboard::Key::Character("+") => app.change_count(1),
            keyboard::Key::Character("-") => app.change_count(-1),
            keyboard::Key::Character("w") => app.move_selected(Vec2::Y),
            keyboard::Key::Character("s") => app.move_selected(Vec2::NEG_Y),
            keyboard::Key::Character("a") => app.move_selected(Vec2::NEG_X),
            keyboard::Key::Character("d") => app.move_selected(Vec2::X),
            keyboard::Key::Character("[") => app.scale_selected(0.9),
            keyboard::Key::Character("]") => app.scale_selected(1.1),
            keyboard::Key::Character("p") => {
                let pane = app.session.pane().toggle();
                app.session.set_pane(pane);
            }
            keyboard::Key::Character("c") => {
                if let Err(err) = app.session.reset_particles(random_seed()) {
                    log::error!("particle reset failed: {err}");
                }
            }
            keyboard::Key::Character("r") => *app.session.view_mut() = ViewState::default(),
            _ => {}
        },
        Event::Keyboard(keyboard::Event::ModifiersChanged(modifiers)) => {
            app.ctrl = modifiers.control();
        }
        Event::Mouse(mouse::Event::ButtonPressed(mouse::Button::Left)) => app.dragging = true,
        Event::Mouse(mouse::Event::ButtonReleased(mouse::Button::Left)) => app.dragging = false,
        Event::Mouse(mouse::Event::CursorMoved { position }) => {
            if let (true, Some(last)) = (app.dragging, app.cursor) {
                let at = Vec2::new(last.x, last.y);
                app.session.pan(at, Vec2::new(position.x, position.y) - at);
            }
            app.cursor = Some(position);
        }
        Event::Mouse(mouse::Event::WheelScrolled { delta }) if app.ctrl => {
            let y = match delta {
                mouse::ScrollDelta::Lines { y, .. } | mouse::ScrollDelta::Pixels { y, .. } => y,
            };
            app.session.view_mut().zoom(y);
        }
        Event::Window(window::Event::Resized(size)) => app.window = size,
        _ => {}
    }
}

fn view(app: &App) -> Element<'_, Message> {
    let session = &app.session;
    let mixture = session.mixture();
    let status = format!(
        "{} | step {} | dt {:.2e} | {} components, peak {:.3} | {}",
        if session.paused() { "PAUSED" } else { "RUNNING" },
        session.backend().steps(),
        session.dt(),
        mixture.count(),
        mixture.peak(),
        match session.pane() {
            LeftPane::Estimate => "left: estimate",
            LeftPane::Particles => "left: particles",
        },
    );
    let selected = match mixture.component(app.selected) {
        Some(g) => format!(
            "component {}: mean ({:.3}, {:.3}) sigma ({:.3}, {:.3}) | view ({:.2}, {:.2}) x{:.2}",
            app.selected,
            g.mean().x,
            g.mean().y,
            g.sigma().x,
            g.sigma().y,
            session.view().center.x,
            session.view().center.y,
            session.view().scale,
        ),
        None => String::new(),
    };
    let controls = "Space=Pause  Up/Down=dt  +/-=Components  Tab=Select  WASD=Move  [/]=Sigma  P=Particles  C=Restart  R=Reset view";

    Column::new()
        .push(
            image(app.frame.clone())
                .width(Length::Fixed(app.frame_size.width))
                .height(Length::Fixed(app.frame_size.height))
                .content_fit(ContentFit::None),
        )
        .push(Text::new(status).size(14))
        .push(Text::new(format!("{selected}    {controls}")).size(12))
        .into()
}

fn subscription(_app: &App) -> Subscription<Message> {
    Subscription::batch([
        iced::time::every(std::time::Duration::from_millis(16)).map(|_| Message::Tick),
        event::listen().map(Message::Event),
    ])
}
