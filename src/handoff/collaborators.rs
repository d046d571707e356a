//! What the coordinator needs from the rest of the kiosk.

/// The media pipeline (video decoding and playback).
pub trait MediaCollaborator {
    /// Stops playback and frees everything the pipeline holds on the GPU and display.
    fn stop_and_release(&mut self);

    fn is_initialized(&self) -> bool;

    /// Recreates the pipeline and binds it to the render consumer again.
    fn initialize(&mut self) -> anyhow::Result<()>;

    /// Refreshes playback state. Called once per main loop iteration.
    fn poll(&mut self) {}
}

/// The input devices.
pub trait InputCollaborator {
    /// Lets go of every device so another process can open them.
    fn release_grabs(&mut self);

    /// Reopens the devices. Returns whether that worked.
    fn reinitialize(&mut self) -> bool;

    /// Pokes devices out of power saving so whoever opens them next sees them.
    fn wake(&mut self);
}

/// Anything holding GPU objects tied to the rendering context.
pub trait RenderContextListener {
    /// Drops and rebuilds GPU objects the external process may have invalidated.
    fn reset_render_context(&mut self);
}

/// Stand-in for kiosks that play no media.
#[derive(Debug, Default)]
pub struct NoMedia;

impl MediaCollaborator for NoMedia {
    fn stop_and_release(&mut self) {}

    fn is_initialized(&self) -> bool {
        true
    }

    fn initialize(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}
