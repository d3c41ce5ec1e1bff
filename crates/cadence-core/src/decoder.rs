//! Audio decoding via Symphonia
//!
//! Turns one audio source into PCM frames in the engine's fixed output
//! format: interleaved f32 at the output sample rate and channel count.
//! Channel layout is remixed here and sample rate is converted with rubato.

use std::collections::VecDeque;
use std::fs::File;
use std::path::{ Path, PathBuf };

use rubato::{ FastFixedOut, PolynomialDegree, Resampler };
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{ Decoder as SymphoniaDecoder, DecoderOptions, CODEC_TYPE_NULL };
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{ FormatOptions, FormatReader, SeekMode, SeekTo };
use symphonia::core::io::{ MediaSourceStream, MediaSourceStreamOptions };
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;
use thiserror::Error;


/// Errors that can occur while opening a source.
#[derive( Debug, Error )]
pub enum DecoderError {
    #[error( "File not found: {0}" )]
    NotFound( PathBuf ),

    #[error( "Unsupported format: {0}" )]
    UnsupportedFormat( String ),

    #[error( "Corrupt stream: {0}" )]
    CorruptStream( String ),

    #[error( "Failed to open file: {0}" )]
    Io( #[from] std::io::Error ),
}


/// PCM layout the engine renders in.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub struct OutputFormat {
    pub sample_rate: u32,
    pub channels: u16,
}


impl Default for OutputFormat {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 2,
        }
    }
}


/// An open source of PCM frames.
///
/// Implementations must be callable from the realtime thread: `read_frames`
/// never panics and never returns an error, it reports trouble through
/// `has_error` instead.
pub trait FrameSource: Send {
    /// Sample rate of the produced frames.
    fn sample_rate( &self ) -> u32;

    /// Channel count of the produced frames.
    fn channels( &self ) -> u16;

    /// Total length in frames, 0 when unknown.
    fn total_frames( &self ) -> u64;

    /// Index of the next frame `read_frames` will produce.
    fn current_frame( &self ) -> u64;

    /// Fills `buffer` with up to `max_frames` interleaved frames.
    ///
    /// Returns the number of frames written, 0 at end of stream.
    fn read_frames( &mut self, buffer: &mut [f32], max_frames: usize ) -> usize;

    /// Moves the cursor to `frame`. Returns false when out of range or not seekable.
    fn seek( &mut self, frame: u64 ) -> bool;

    /// Sticky flag set when decoding failed mid-stream.
    fn has_error( &self ) -> bool;

    /// Releases the underlying resources. Safe to call more than once.
    fn close( &mut self );

    fn is_open( &self ) -> bool;
}


/// Opens frame sources for local paths.
pub trait DecoderOpener: Send + Sync {
    fn open( &self, path: &Path, format: OutputFormat ) -> Result<Box<dyn FrameSource>, DecoderError>;
}


/// Default opener backed by Symphonia.
#[derive( Debug, Clone, Copy, Default )]
pub struct SymphoniaOpener;


impl DecoderOpener for SymphoniaOpener {
    fn open( &self, path: &Path, format: OutputFormat ) -> Result<Box<dyn FrameSource>, DecoderError> {
        Ok( Box::new( Decoder::open( path, format )? ) )
    }
}


/// Live decoding state, dropped on close.
struct Stream {
    format_reader: Box<dyn FormatReader>,
    decoder: Box<dyn SymphoniaDecoder>,
    track_id: u32,
    source_channels: usize,
    output_channels: usize,
    sample_buf: Option<SampleBuffer<f32>>,
    resampler: Option<FastFixedOut<f32>>,
    /// Planar input waiting for the resampler
    resample_input: Vec<Vec<f32>>,
    /// Converted interleaved samples ready to hand out
    pending: VecDeque<f32>,
    /// Source frames to drop after an accurate seek landed early
    skip_frames: u64,
    eof: bool,
}


/// Audio decoder wrapper around Symphonia.
pub struct Decoder {
    stream: Option<Stream>,
    output: OutputFormat,
    source_rate: u32,
    total_frames: u64,
    current_frame: u64,
    failed: bool,
}


impl Decoder {
    /// Opens an audio file for decoding into `output`.
    ///
    /// Supports SMB/UNC paths transparently via std::fs.
    pub fn open( path: &Path, output: OutputFormat ) -> Result<Self, DecoderError> {
        if output.channels == 0 || output.sample_rate == 0 {
            return Err( DecoderError::UnsupportedFormat( format!( "output format {:?}", output ) ) );
        }

        // Use larger buffer for network paths (SMB)
        let buffer_len = if path.starts_with( r"\\" ) {
            256 * 1024
        } else {
            64 * 1024
        };

        let file = File::open( path ).map_err( |e| match e.kind() {
            std::io::ErrorKind::NotFound => DecoderError::NotFound( path.to_path_buf() ),
            _ => DecoderError::Io( e ),
        })?;
        let mss_opts = MediaSourceStreamOptions { buffer_len };
        let mss = MediaSourceStream::new( Box::new( file ), mss_opts );

        let mut hint = Hint::new();
        if let Some( ext ) = path.extension().and_then( |e| e.to_str() ) {
            hint.with_extension( ext );
        }

        let probed = symphonia::default::get_probe()
            .format( &hint, mss, &FormatOptions::default(), &MetadataOptions::default() )
            .map_err( |e| match e {
                SymphoniaError::Unsupported( what ) => DecoderError::UnsupportedFormat( what.to_string() ),
                other => DecoderError::CorruptStream( other.to_string() ),
            })?;

        let format_reader = probed.format;

        let track = format_reader
            .tracks()
            .iter()
            .find( |t| t.codec_params.codec != CODEC_TYPE_NULL )
            .ok_or_else( || DecoderError::UnsupportedFormat( "no audio track".into() ) )?;

        let track_id = track.id;
        let codec_params = &track.codec_params;

        let source_rate = codec_params.sample_rate.unwrap_or( 44100 );
        let source_channels = codec_params.channels.map( |c| c.count() ).unwrap_or( 2 );

        // Length is reported in output frames
        let total_frames = codec_params.n_frames
            .map( |frames| {
                ( frames as u128 * output.sample_rate as u128 / source_rate as u128 ) as u64
            })
            .unwrap_or( 0 );

        let decoder = symphonia::default::get_codecs()
            .make( codec_params, &DecoderOptions::default() )
            .map_err( |e| DecoderError::UnsupportedFormat( e.to_string() ) )?;

        let resampler = if source_rate != output.sample_rate {
            tracing::info!( "Resampling: {} Hz → {} Hz", source_rate, output.sample_rate );

            let resampler = FastFixedOut::<f32>::new(
                output.sample_rate as f64 / source_rate as f64,
                2.0,
                PolynomialDegree::Cubic,
                1024,
                output.channels as usize,
            ).map_err( |e| DecoderError::UnsupportedFormat( format!( "resampler: {}", e ) ) )?;

            Some( resampler )
        } else {
            None
        };

        tracing::info!(
            "Opened {:?}: {} Hz, {} channels, {} frames",
            path,
            source_rate,
            source_channels,
            total_frames
        );

        Ok( Self {
            stream: Some( Stream {
                format_reader,
                decoder,
                track_id,
                source_channels,
                output_channels: output.channels as usize,
                sample_buf: None,
                resampler,
                resample_input: ( 0..output.channels ).map( |_| Vec::new() ).collect(),
                pending: VecDeque::new(),
                skip_frames: 0,
                eof: false,
            }),
            output,
            source_rate,
            total_frames,
            current_frame: 0,
            failed: false,
        })
    }


    /// Sample rate of the file itself, before conversion.
    pub fn source_sample_rate( &self ) -> u32 {
        self.source_rate
    }
}


impl FrameSource for Decoder {
    fn sample_rate( &self ) -> u32 {
        self.output.sample_rate
    }


    fn channels( &self ) -> u16 {
        self.output.channels
    }


    fn total_frames( &self ) -> u64 {
        self.total_frames
    }


    fn current_frame( &self ) -> u64 {
        self.current_frame
    }


    fn read_frames( &mut self, buffer: &mut [f32], max_frames: usize ) -> usize {
        let Some( stream ) = self.stream.as_mut() else {
            return 0;
        };

        let channels = stream.output_channels;
        let frames = max_frames.min( buffer.len() / channels );
        let wanted = frames * channels;

        if stream.fill( wanted ).is_err() {
            self.failed = true;
            stream.eof = true;
        }

        let available = stream.pending.len().min( wanted ) / channels * channels;
        for ( dst, src ) in buffer[ ..available ].iter_mut().zip( stream.pending.drain( ..available ) ) {
            *dst = src;
        }

        let produced = available / channels;
        self.current_frame += produced as u64;
        produced
    }


    fn seek( &mut self, frame: u64 ) -> bool {
        let Some( stream ) = self.stream.as_mut() else {
            return false;
        };

        if self.total_frames > 0 && frame > self.total_frames {
            return false;
        }

        if stream.seek_to( frame, self.output.sample_rate ) {
            self.current_frame = frame;
            true
        } else {
            // Put the reader back where the frame counter says it is
            if !stream.seek_to( self.current_frame, self.output.sample_rate ) {
                tracing::warn!( "Failed to restore position after seek failure" );
            }
            false
        }
    }


    fn has_error( &self ) -> bool {
        self.failed
    }


    fn close( &mut self ) {
        if self.stream.take().is_some() {
            tracing::debug!( "Decoder closed" );
        }
    }


    fn is_open( &self ) -> bool {
        self.stream.is_some()
    }
}


impl Stream {
    /// Decodes until at least `wanted` converted samples are pending or the stream ends.
    fn fill( &mut self, wanted: usize ) -> Result<(), SymphoniaError> {
        while self.pending.len() < wanted && !self.eof {
            match self.decode_next()? {
                Some( samples ) => {
                    let remixed = remix( &samples, self.source_channels, self.output_channels );
                    self.push_converted( remixed )?;
                }
                None => {
                    self.eof = true;
                    self.flush_resampler()?;
                }
            }
        }
        Ok(())
    }


    /// Decodes the next packet and returns interleaved f32 samples in the source layout.
    ///
    /// Returns None when EOF is reached.
    fn decode_next( &mut self ) -> Result<Option<Vec<f32>>, SymphoniaError> {
        loop {
            let packet = match self.format_reader.next_packet() {
                Ok( packet ) => packet,
                Err( SymphoniaError::IoError( ref e ) )
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok( None );
                }
                Err( e ) => return Err( e ),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode( &packet ) {
                Ok( decoded ) => decoded,
                // Recoverable, skip this packet
                Err( SymphoniaError::DecodeError( _ ) ) => continue,
                Err( e ) => return Err( e ),
            };

            let spec = *decoded.spec();
            let num_frames = decoded.frames();
            let needed = num_frames * spec.channels.count();

            if self.sample_buf.as_ref().map_or( true, |b| b.capacity() < needed ) {
                self.sample_buf = None;
            }
            let sample_buf = self.sample_buf
                .get_or_insert_with( || SampleBuffer::new( num_frames as u64, spec ) );
            sample_buf.copy_interleaved_ref( decoded );

            let mut samples = sample_buf.samples();
            if self.skip_frames > 0 {
                let skip = ( self.skip_frames as usize ).min( num_frames );
                self.skip_frames -= skip as u64;
                samples = &samples[ skip * self.source_channels.. ];
                if samples.is_empty() {
                    continue;
                }
            }

            return Ok( Some( samples.to_vec() ) );
        }
    }


    /// Passes output-layout samples through the resampler (if any) into `pending`.
    fn push_converted( &mut self, samples: Vec<f32> ) -> Result<(), SymphoniaError> {
        let Some( resampler ) = self.resampler.as_mut() else {
            self.pending.extend( samples );
            return Ok(());
        };

        for chunk in samples.chunks( self.output_channels ) {
            for ( ch_idx, sample ) in chunk.iter().enumerate() {
                self.resample_input[ ch_idx ].push( *sample );
            }
        }

        while self.resample_input[ 0 ].len() >= resampler.input_frames_next() {
            let needed = resampler.input_frames_next();
            let input_chunk: Vec<Vec<f32>> = self.resample_input
                .iter_mut()
                .map( |ch| ch.drain( ..needed ).collect() )
                .collect();

            let resampled = resampler.process( &input_chunk, None )
                .map_err( |e| SymphoniaError::Unsupported( resample_failure( &e ) ) )?;
            self.pending.extend( interleave( &resampled ) );
        }

        Ok(())
    }


    /// Pushes whatever the resampler still holds at end of stream.
    fn flush_resampler( &mut self ) -> Result<(), SymphoniaError> {
        let Some( resampler ) = self.resampler.as_mut() else {
            return Ok(());
        };

        if self.resample_input[ 0 ].is_empty() {
            return Ok(());
        }

        let resampled = resampler.process_partial( Some( self.resample_input.as_slice() ), None )
            .map_err( |e| SymphoniaError::Unsupported( resample_failure( &e ) ) )?;
        self.pending.extend( interleave( &resampled ) );

        for ch in self.resample_input.iter_mut() {
            ch.clear();
        }
        Ok(())
    }


    /// Seeks the reader to an output frame index and drops buffered audio.
    fn seek_to( &mut self, frame: u64, output_rate: u32 ) -> bool {
        let seek_to = SeekTo::Time {
            time: Time::from( frame as f64 / output_rate as f64 ),
            track_id: Some( self.track_id ),
        };

        match self.format_reader.seek( SeekMode::Accurate, seek_to ) {
            Ok( seeked ) => {
                self.decoder.reset();
                self.pending.clear();
                for ch in self.resample_input.iter_mut() {
                    ch.clear();
                }
                if let Some( resampler ) = self.resampler.as_mut() {
                    resampler.reset();
                }
                self.skip_frames = seeked.required_ts.saturating_sub( seeked.actual_ts );
                self.eof = false;
                true
            }
            Err( e ) => {
                tracing::debug!( "Seek to frame {} failed: {}", frame, e );
                false
            }
        }
    }
}


fn resample_failure( e: &rubato::ResampleError ) -> &'static str {
    tracing::error!( "Resample error: {}", e );
    "resampler failure"
}


/// Converts interleaved samples between channel layouts.
///
/// Mono is duplicated, stereo is averaged down to mono, anything else keeps
/// the leading channels and repeats the last one to fill extra outputs.
pub fn remix( samples: &[f32], src_ch: usize, out_ch: usize ) -> Vec<f32> {
    if src_ch == out_ch || src_ch == 0 || out_ch == 0 {
        return samples.to_vec();
    }

    let frames = samples.len() / src_ch;
    let mut out = Vec::with_capacity( frames * out_ch );

    if src_ch == 1 && out_ch == 2 {
        for &sample in samples {
            out.push( sample );
            out.push( sample );
        }
    } else if src_ch == 2 && out_ch == 1 {
        for frame in samples.chunks_exact( 2 ) {
            out.push( ( frame[ 0 ] + frame[ 1 ] ) * 0.5 );
        }
    } else {
        for frame in samples.chunks_exact( src_ch ) {
            for ch in 0..out_ch {
                out.push( frame[ ch.min( src_ch - 1 ) ] );
            }
        }
    }

    out
}


/// Converts planar samples back to interleaved format.
/// [[L0, L1, ...], [R0, R1, ...]] → [L0, R0, L1, R1, ...]
fn interleave( channels: &[Vec<f32>] ) -> Vec<f32> {
    if channels.is_empty() || channels[ 0 ].is_empty() {
        return Vec::new();
    }
    let frames = channels[ 0 ].len();
    let mut out = Vec::with_capacity( frames * channels.len() );
    for f in 0..frames {
        for ch in channels {
            out.push( ch[ f ] );
        }
    }
    out
}


#[cfg( test )]
pub( crate ) mod tests {
    use super::*;
    use std::io::Write;


    /// Writes a 16-bit PCM WAV whose samples ramp with the frame index.
    pub( crate ) fn write_wav( path: &Path, sample_rate: u32, channels: u16, frames: u32 ) {
        let data_len = frames * channels as u32 * 2;
        let mut bytes = Vec::with_capacity( 44 + data_len as usize );
        bytes.extend_from_slice( b"RIFF" );
        bytes.extend_from_slice( &( 36 + data_len ).to_le_bytes() );
        bytes.extend_from_slice( b"WAVEfmt " );
        bytes.extend_from_slice( &16u32.to_le_bytes() );
        bytes.extend_from_slice( &1u16.to_le_bytes() );
        bytes.extend_from_slice( &channels.to_le_bytes() );
        bytes.extend_from_slice( &sample_rate.to_le_bytes() );
        bytes.extend_from_slice( &( sample_rate * channels as u32 * 2 ).to_le_bytes() );
        bytes.extend_from_slice( &( channels * 2 ).to_le_bytes() );
        bytes.extend_from_slice( &16u16.to_le_bytes() );
        bytes.extend_from_slice( b"data" );
        bytes.extend_from_slice( &data_len.to_le_bytes() );
        for frame in 0..frames {
            for _ in 0..channels {
                bytes.extend_from_slice( &ramp( frame ).to_le_bytes() );
            }
        }
        let mut file = File::create( path ).unwrap();
        file.write_all( &bytes ).unwrap();
    }


    fn ramp( frame: u32 ) -> i16 {
        ( frame % 1000 ) as i16 * 30
    }


    fn expected( frame: u32 ) -> f32 {
        ramp( frame ) as f32 / 32768.0
    }


    #[test]
    fn test_remix_mono_to_stereo() {
        assert_eq!( remix( &[ 0.1, 0.2 ], 1, 2 ), vec![ 0.1, 0.1, 0.2, 0.2 ] );
    }


    #[test]
    fn test_remix_stereo_to_mono() {
        assert_eq!( remix( &[ 0.2, 0.4, -1.0, 1.0 ], 2, 1 ), vec![ 0.3, 0.0 ] );
    }


    #[test]
    fn test_remix_general_repeats_last_channel() {
        assert_eq!( remix( &[ 1.0, 2.0, 3.0, 4.0 ], 2, 3 ), vec![ 1.0, 2.0, 2.0, 3.0, 4.0, 4.0 ] );
        assert_eq!( remix( &[ 1.0, 2.0, 3.0 ], 3, 2 ), vec![ 1.0, 2.0 ] );
    }


    #[test]
    fn test_interleave() {
        let planar = vec![ vec![ 1.0, 2.0 ], vec![ 3.0, 4.0 ] ];
        assert_eq!( interleave( &planar ), vec![ 1.0, 3.0, 2.0, 4.0 ] );
        assert!( interleave( &[] ).is_empty() );
    }


    #[test]
    fn test_open_missing_file() {
        let result = Decoder::open( Path::new( "/definitely/not/here.wav" ), OutputFormat::default() );
        assert!( matches!( result, Err( DecoderError::NotFound( _ ) ) ) );
    }


    #[test]
    fn test_open_garbage_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "noise.bin" );
        std::fs::write( &path, b"this is not audio at all, just some text bytes" ).unwrap();

        let result = Decoder::open( &path, OutputFormat::default() );
        assert!( matches!( result, Err( DecoderError::UnsupportedFormat( _ ) ) ) );
    }


    #[test]
    fn test_reads_whole_file_in_output_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "ramp.wav" );
        write_wav( &path, 8000, 1, 4000 );

        let format = OutputFormat { sample_rate: 8000, channels: 2 };
        let mut decoder = SymphoniaOpener.open( &path, format ).unwrap();
        assert_eq!( decoder.sample_rate(), 8000 );
        assert_eq!( decoder.channels(), 2 );
        assert_eq!( decoder.total_frames(), 4000 );

        let mut buf = vec![ 0.0f32; 512 * 2 ];
        let mut total = 0;
        loop {
            let n = decoder.read_frames( &mut buf, 512 );
            if n == 0 {
                break;
            }
            if total == 0 {
                assert!( ( buf[ 2 ] - expected( 1 ) ).abs() < 1e-4 );
                assert_eq!( buf[ 2 ], buf[ 3 ] );
            }
            total += n;
        }

        assert_eq!( total, 4000 );
        assert_eq!( decoder.current_frame(), 4000 );
        assert!( !decoder.has_error() );
    }


    #[test]
    fn test_seek_lands_on_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "ramp.wav" );
        write_wav( &path, 8000, 1, 4000 );

        let mut decoder = Decoder::open( &path, OutputFormat { sample_rate: 8000, channels: 1 } ).unwrap();
        assert!( decoder.seek( 1234 ) );
        assert_eq!( decoder.current_frame(), 1234 );

        let mut buf = [ 0.0f32; 4 ];
        assert_eq!( decoder.read_frames( &mut buf, 4 ), 4 );
        assert!( ( buf[ 0 ] - expected( 1234 ) ).abs() < 1e-4 );
        assert!( ( buf[ 3 ] - expected( 1237 ) ).abs() < 1e-4 );
    }


    #[test]
    fn test_seek_past_end_fails_and_keeps_reading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "ramp.wav" );
        write_wav( &path, 8000, 1, 4000 );

        let mut decoder = Decoder::open( &path, OutputFormat { sample_rate: 8000, channels: 1 } ).unwrap();
        let mut buf = [ 0.0f32; 10 ];
        assert_eq!( decoder.read_frames( &mut buf, 10 ), 10 );

        assert!( !decoder.seek( 4001 ) );
        assert_eq!( decoder.current_frame(), 10 );

        assert_eq!( decoder.read_frames( &mut buf, 2 ), 2 );
        assert!( ( buf[ 0 ] - expected( 10 ) ).abs() < 1e-4 );
    }


    #[test]
    fn test_resampled_length_is_in_output_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "ramp.wav" );
        write_wav( &path, 8000, 2, 4000 );

        let decoder = Decoder::open( &path, OutputFormat { sample_rate: 16000, channels: 2 } ).unwrap();
        assert_eq!( decoder.sample_rate(), 16000 );
        assert_eq!( decoder.source_sample_rate(), 8000 );
        assert_eq!( decoder.total_frames(), 8000 );
    }


    #[test]
    fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "ramp.wav" );
        write_wav( &path, 8000, 1, 100 );

        let mut decoder = Decoder::open( &path, OutputFormat::default() ).unwrap();
        assert!( decoder.is_open() );
        decoder.close();
        decoder.close();
        assert!( !decoder.is_open() );

        let mut buf = [ 0.0f32; 8 ];
        assert_eq!( decoder.read_frames( &mut buf, 4 ), 0 );
        assert!( !decoder.seek( 0 ) );
    }
}
