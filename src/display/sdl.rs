//! SDL2 Window Display Module
//! Creates an SDL2 window and paints preview frames, letterboxed to keep
//! the source aspect ratio.

use color_eyre::{eyre::eyre, Result};
use sdl2::event::Event;
use sdl2::pixels::{Color, PixelFormatEnum};
use sdl2::rect::Rect;
use sdl2::render::{Canvas, TextureCreator};
use sdl2::video::{Window, WindowContext};
use tokio::sync::watch;
use tracing::info;

use super::{PreviewSink, RenderLoop, RenderStats};
use crate::pipeline::fit_within;
use crate::{Frame, PixelFormat};

/// SDL2 preview window
pub struct Sdl2Display {
    canvas: Canvas<Window>,
    texture_creator: TextureCreator<WindowContext>,
    event_pump: sdl2::EventPump,
    width: u32,
    height: u32,
}

impl Sdl2Display {
    pub fn new(sdl_context: &sdl2::Sdl, width: u32, height: u32) -> Result<Self> {
        let video_subsystem = sdl_context.video().map_err(|e| eyre!(e))?;

        let window = video_subsystem
            .window("StreamLiter Preview", width, height)
            .position_centered()
            .resizable()
            .build()?;

        let canvas = window.into_canvas().present_vsync().build()?;
        let texture_creator = canvas.texture_creator();
        let event_pump = sdl_context.event_pump().map_err(|e| eyre!(e))?;

        Ok(Self {
            canvas,
            texture_creator,
            event_pump,
            width,
            height,
        })
    }

    /// Drain window events; false once the window was closed
    pub fn pump_events(&mut self) -> bool {
        for event in self.event_pump.poll_iter() {
            match event {
                Event::Quit { .. } => {
                    info!("Quit event received");
                    return false;
                }
                Event::Window {
                    win_event: sdl2::event::WindowEvent::Resized(w, h),
                    ..
                } => {
                    self.width = w.max(1) as u32;
                    self.height = h.max(1) as u32;
                }
                _ => {}
            }
        }
        true
    }

    /// Drive `render` on this thread until the window closes or `stop` flips
    pub fn run(render: RenderLoop<Sdl2Display>, stop: watch::Receiver<bool>) -> RenderStats {
        render.run_blocking(|display| display.pump_events() && !*stop.borrow())
    }
}

impl PreviewSink for Sdl2Display {
    fn render(&mut self, frame: &Frame) -> Result<()> {
        let meta = &frame.meta;
        if meta.format != PixelFormat::Rgb24 {
            return Err(eyre!("SDL preview expects rgb24, got {:?}", meta.format));
        }

        let mut texture = self
            .texture_creator
            .create_texture_streaming(PixelFormatEnum::RGB24, meta.width, meta.height)
            .map_err(|e| eyre!(e))?;

        texture
            .update(None, &frame.data, meta.stride as usize)
            .map_err(|e| eyre!(e))?;

        let (w, h) = fit_within(meta.width, meta.height, self.width, self.height);
        let x = (self.width.saturating_sub(w) / 2) as i32;
        let y = (self.height.saturating_sub(h) / 2) as i32;

        self.canvas.set_draw_color(Color::RGB(0x2b, 0x2b, 0x2b));
        self.canvas.clear();
        self.canvas
            .copy(&texture, None, Some(Rect::new(x, y, w, h)))
            .map_err(|e| eyre!(e))?;

        self.canvas.present();
        Ok(())
    }
}
