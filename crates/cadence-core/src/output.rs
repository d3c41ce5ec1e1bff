//! Audio output via cpal
//!
//! The output device pulls audio: cpal calls back on its own thread and the
//! engine's renderer fills the buffer. Nothing here decodes or buffers.

use cpal::traits::{ DeviceTrait, HostTrait, StreamTrait };
use thiserror::Error;

use crate::decoder::OutputFormat;


/// Errors that can occur with audio output.
#[derive( Debug, Error )]
pub enum OutputError {
    #[error( "No output device available" )]
    NoDevice,

    #[error( "Failed to get default stream config: {0}" )]
    StreamConfig( String ),

    #[error( "Failed to build output stream: {0}" )]
    BuildStream( String ),

    #[error( "Failed to play stream: {0}" )]
    PlayStream( String ),
}


/// Which output implementation the engine should open.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Default )]
pub enum OutputBackend {
    /// The host's default device through cpal.
    #[default]
    Cpal,
    /// No device at all; the renderer is only driven by hand.
    Null,
}


/// A started/paused stream owned by the engine.
pub trait OutputStream: Send {
    /// The layout the device consumes; decoders are opened to match it.
    fn format( &self ) -> OutputFormat;

    fn start( &self ) -> Result<(), OutputError>;

    fn pause( &self ) -> Result<(), OutputError>;
}


/// Wrapper that lets the cpal stream live inside the engine.
struct StreamHandle( cpal::Stream );

// SAFETY: the engine only touches the stream under its transition lock, so
// it is never used from two threads at once. The raw pointers inside are
// driven by cpal's own callback thread.
unsafe impl Send for StreamHandle {}


/// Output through the system's default device.
pub struct CpalOutput {
    stream: StreamHandle,
    format: OutputFormat,
}


impl CpalOutput {
    /// Opens the default output device, preferring `preferred`.
    ///
    /// `render` is invoked on the realtime thread with the interleaved output
    /// buffer and the device channel count.
    pub fn open<F>( preferred: OutputFormat, mut render: F ) -> Result<Self, OutputError>
    where
        F: FnMut( &mut [f32], usize ) + Send + 'static,
    {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or( OutputError::NoDevice )?;

        tracing::info!( "Using output device: {:?}", device.name() );

        let supported_configs: Vec<_> = device
            .supported_output_configs()
            .map_err( |e| OutputError::StreamConfig( e.to_string() ) )?
            .filter( |c| c.sample_format() == cpal::SampleFormat::F32 )
            .collect();

        let rate = preferred.sample_rate;
        let supports_rate = |c: &cpal::SupportedStreamConfigRange| {
            c.min_sample_rate().0 <= rate && c.max_sample_rate().0 >= rate
        };

        // Priority: 1) exact match, 2) same sample rate any channels, 3) device default
        let config = if let Some( supported ) = supported_configs.iter().find( |c| {
            c.channels() == preferred.channels && supports_rate( *c )
        }) {
            supported.clone().with_sample_rate( cpal::SampleRate( rate ) ).config()
        } else if let Some( supported ) = supported_configs.iter().find( |c| supports_rate( *c ) ) {
            tracing::info!(
                "Device has no {}-channel mode at {} Hz, using {} channels",
                preferred.channels,
                rate,
                supported.channels()
            );
            supported.clone().with_sample_rate( cpal::SampleRate( rate ) ).config()
        } else {
            let default_config = device
                .default_output_config()
                .map_err( |e| OutputError::StreamConfig( e.to_string() ) )?;
            tracing::warn!(
                "Device does not support {} Hz, using its default {} Hz",
                rate,
                default_config.sample_rate().0
            );
            default_config.config()
        };

        tracing::info!(
            "Audio output config: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let channels = config.channels as usize;
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    render( data, channels );
                },
                |err| {
                    tracing::error!( "Audio output error: {}", err );
                },
                None,
            )
            .map_err( |e| OutputError::BuildStream( e.to_string() ) )?;

        // Streams may start running on creation with some hosts
        let _ = stream.pause();

        Ok( Self {
            stream: StreamHandle( stream ),
            format: OutputFormat {
                sample_rate: config.sample_rate.0,
                channels: config.channels,
            },
        })
    }
}


impl OutputStream for CpalOutput {
    fn format( &self ) -> OutputFormat {
        self.format
    }


    fn start( &self ) -> Result<(), OutputError> {
        self.stream.0
            .play()
            .map_err( |e| OutputError::PlayStream( e.to_string() ) )
    }


    fn pause( &self ) -> Result<(), OutputError> {
        self.stream.0
            .pause()
            .map_err( |e| OutputError::PlayStream( e.to_string() ) )
    }
}


/// Output that accepts every request and plays nothing.
///
/// Used for headless runs and tests, where the renderer is called directly.
#[derive( Debug, Clone, Copy )]
pub struct NullOutput {
    format: OutputFormat,
}


impl NullOutput {
    pub fn new( format: OutputFormat ) -> Self {
        Self { format }
    }
}


impl OutputStream for NullOutput {
    fn format( &self ) -> OutputFormat {
        self.format
    }


    fn start( &self ) -> Result<(), OutputError> {
        tracing::debug!( "Null output started" );
        Ok(())
    }


    fn pause( &self ) -> Result<(), OutputError> {
        tracing::debug!( "Null output paused" );
        Ok(())
    }
}
