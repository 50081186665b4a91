use std::{sync::Arc, time::Duration};

use egui::{Align2, Color32, ColorImage, FontId, TextureHandle, TextureOptions};
use parking_lot::Mutex;

use crate::{
    media::{Player, events::PlayerEvent},
    video::{
        display::{PictureSink, display_rect},
        picture::Picture,
    },
};

/// Mailbox between the refresh scheduler and the paint pass: the engine
/// publishes at most one pending picture, the UI drains it on repaint.
pub struct SharedFrame {
    picture: Mutex<Option<Picture>>,
    repaint: Mutex<Option<egui::Context>>,
}

impl SharedFrame {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            picture: Mutex::new(None),
            repaint: Mutex::new(None),
        })
    }

    /// Wired once the window exists; publishes before that are kept but
    /// cannot trigger a repaint.
    pub fn install_context(&self, ctx: egui::Context) {
        *self.repaint.lock() = Some(ctx);
    }

    fn publish(&self, picture: Picture) {
        *self.picture.lock() = Some(picture);
        if let Some(ctx) = self.repaint.lock().as_ref() {
            ctx.request_repaint();
        }
    }

    pub fn take(&self) -> Option<Picture> {
        self.picture.lock().take()
    }
}

/// Engine-facing end of the mailbox.
pub struct FramePublisher(pub Arc<SharedFrame>);

impl PictureSink for FramePublisher {
    fn display(&mut self, picture: Picture) {
        self.0.publish(picture);
    }
}

pub struct PlayerApp {
    player: Player,
    events: flume::Sender<PlayerEvent>,
    shared: Arc<SharedFrame>,
    texture: Option<TextureHandle>,
    texture_size: (u32, u32),
    aspect: f64,
}

impl PlayerApp {
    pub fn new(cc: &eframe::CreationContext<'_>, player: Player, shared: Arc<SharedFrame>) -> Self {
        shared.install_context(cc.egui_ctx.clone());
        let events = player.events();
        Self {
            player,
            events,
            shared,
            texture: None,
            texture_size: (0, 0),
            aspect: 16.0 / 9.0,
        }
    }

    fn send(&self, event: PlayerEvent) {
        let _ = self.events.send(event);
    }

    fn handle_keys(&self, ctx: &egui::Context) {
        ctx.input(|input| {
            if input.key_pressed(egui::Key::Space) {
                self.send(PlayerEvent::TogglePause);
            }
            if input.key_pressed(egui::Key::ArrowLeft) {
                self.send(PlayerEvent::SeekBy(-10.0));
            }
            if input.key_pressed(egui::Key::ArrowRight) {
                self.send(PlayerEvent::SeekBy(10.0));
            }
            if input.key_pressed(egui::Key::ArrowUp) {
                self.send(PlayerEvent::SeekBy(60.0));
            }
            if input.key_pressed(egui::Key::ArrowDown) {
                self.send(PlayerEvent::SeekBy(-60.0));
            }
        });
    }

    fn upload(&mut self, ctx: &egui::Context, picture: Picture) {
        let size = [picture.width as usize, picture.height as usize];
        let image = ColorImage::from_rgba_unmultiplied(size, &picture.data);
        self.aspect = picture.aspect;

        // the texture is re-created only when the frame geometry changes
        let realloc =
            self.texture.is_none() || self.texture_size != (picture.width, picture.height);
        if realloc {
            self.texture = Some(ctx.load_texture("video-frame", image, TextureOptions::LINEAR));
            self.texture_size = (picture.width, picture.height);
        } else if let Some(texture) = &mut self.texture {
            texture.set(image, TextureOptions::LINEAR);
        }
    }

    fn transport_controls(&self, ui: &mut egui::Ui) {
        ui.horizontal(|ui| {
            if ui.button("<<").clicked() {
                self.send(PlayerEvent::SeekBy(-10.0));
            }
            let pause_label = if self.player.is_paused() { ">" } else { "||" };
            if ui.button(pause_label).clicked() {
                self.send(PlayerEvent::TogglePause);
            }
            if ui.button(">>").clicked() {
                self.send(PlayerEvent::SeekBy(10.0));
            }
        });
    }
}

impl eframe::App for PlayerApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.handle_keys(ctx);
        if let Some(picture) = self.shared.take() {
            self.upload(ctx, picture);
        }

        egui::TopBottomPanel::bottom("transport").show(ctx, |ui| {
            self.transport_controls(ui);
        });

        egui::CentralPanel::default()
            .frame(egui::Frame::none().fill(Color32::BLACK))
            .show(ctx, |ui| {
                let panel = ui.max_rect();
                if let Some(texture) = &self.texture {
                    let (x, y, w, h) = display_rect(self.aspect, panel.width(), panel.height());
                    let rect =
                        egui::Rect::from_min_size(panel.min + egui::vec2(x, y), egui::vec2(w, h));
                    ui.painter().image(
                        texture.id(),
                        rect,
                        egui::Rect::from_min_max(egui::pos2(0.0, 0.0), egui::pos2(1.0, 1.0)),
                        Color32::WHITE,
                    );
                }
                if self.player.is_paused() {
                    ui.painter().text(
                        panel.center(),
                        Align2::CENTER_CENTER,
                        "Paused",
                        FontId::proportional(24.0),
                        Color32::WHITE,
                    );
                }
            });

        // keeps the overlay and button state fresh between frames
        ctx.request_repaint_after(Duration::from_millis(100));
    }

    fn on_exit(&mut self, _gl: Option<&eframe::glow::Context>) {
        self.player.shutdown();
    }
}
