/*!
    Format descriptors for elementary streams.
*/

/**
    Video pixel layouts, raw and compressed.

    Only the layouts the bridge negotiates with its consumers are represented.
*/
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum VideoFormat {
    /// Layout could not be mapped.
    #[default]
    Unknown,
    /// Packed BGRA, 32bpp
    Bgra,
    /// Packed BGR with padding byte, 32bpp
    Bgrx,
    /// Packed BGR, 24bpp
    Bgr,
    /// Packed RGB 5-5-5, 16bpp
    Rgb15,
    /// Packed RGB 5-6-5, 16bpp
    Rgb16,
    /// Packed AYUV 4:4:4, 32bpp
    Ayuv,
    /// Planar YUV 4:2:0, 12bpp
    I420,
    /// Semi-planar YUV 4:2:0, 12bpp
    Nv12,
    /// Packed YUV 4:2:2 (U0 Y0 V0 Y1), 16bpp
    Uyvy,
    /// Packed YUV 4:2:2 (Y0 U0 Y1 V0), 16bpp
    Yuy2,
    /// Planar YVU 4:2:0, 12bpp
    Yv12,
    /// Packed YUV 4:2:2 (Y0 V0 Y1 U0), 16bpp
    Yvyu,
    /// Cinepak compressed video
    Cinepak,
    /// H.264 compressed video
    H264,
}

impl VideoFormat {
    /**
        Returns true for the RGB family.

        RGB frames are stored bottom-up by consumers of this bridge, so these
        layouts need a vertical flip on the way out of the graph.
    */
    pub const fn is_rgb(self) -> bool {
        matches!(
            self,
            Self::Bgra | Self::Bgrx | Self::Bgr | Self::Rgb15 | Self::Rgb16
        )
    }

    /**
        Returns true for compressed layouts.
    */
    pub const fn is_compressed(self) -> bool {
        matches!(self, Self::Cinepak | Self::H264)
    }

    /**
        Returns the number of bits per pixel for raw layouts.

        For planar formats, this is the average bits per pixel.
    */
    pub const fn bits_per_pixel(self) -> Option<u32> {
        match self {
            Self::I420 | Self::Nv12 | Self::Yv12 => Some(12),
            Self::Rgb15 | Self::Rgb16 | Self::Uyvy | Self::Yuy2 | Self::Yvyu => Some(16),
            Self::Bgr => Some(24),
            Self::Bgra | Self::Bgrx | Self::Ayuv => Some(32),
            Self::Unknown | Self::Cinepak | Self::H264 => None,
        }
    }
}

/**
    Audio sample layouts, raw and compressed.
*/
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum AudioFormat {
    /// Layout could not be mapped.
    #[default]
    Unknown,
    /// Unsigned 8-bit integer
    U8,
    /// Signed 16-bit integer, little-endian
    S16le,
    /// Signed 24-bit integer, little-endian
    S24le,
    /// Signed 32-bit integer, little-endian
    S32le,
    /// 32-bit floating point, little-endian
    F32le,
    /// 64-bit floating point, little-endian
    F64le,
    /// MPEG-1 layer I
    Mpeg1Layer1,
    /// MPEG-1 layer II
    Mpeg1Layer2,
    /// MPEG-1 layer III
    Mpeg1Layer3,
    /// Advanced Audio Coding
    Aac,
}

impl AudioFormat {
    /**
        Returns the number of bytes per sample for raw layouts.
    */
    pub const fn bytes_per_sample(self) -> Option<u32> {
        match self {
            Self::U8 => Some(1),
            Self::S16le => Some(2),
            Self::S24le => Some(3),
            Self::S32le | Self::F32le => Some(4),
            Self::F64le => Some(8),
            Self::Unknown
            | Self::Mpeg1Layer1
            | Self::Mpeg1Layer2
            | Self::Mpeg1Layer3
            | Self::Aac => None,
        }
    }

    /**
        Returns true for compressed layouts.
    */
    pub const fn is_compressed(self) -> bool {
        matches!(
            self,
            Self::Mpeg1Layer1 | Self::Mpeg1Layer2 | Self::Mpeg1Layer3 | Self::Aac
        )
    }
}

/**
    A rational number, used for frame rates.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Rational {
    pub num: u32,
    pub den: u32,
}

impl Rational {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /**
        Returns the value as a float, or zero for a zero denominator.
    */
    pub fn to_f64(self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }
}

impl Default for Rational {
    fn default() -> Self {
        Self::new(0, 1)
    }
}

/**
    Shape of a video stream.
*/
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct VideoInfo {
    /// Pixel layout.
    pub format: VideoFormat,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Frame rate (zero when variable or unknown).
    pub fps: Rational,
}

impl VideoInfo {
    /**
        Returns the size in bytes of one raw frame, if the layout is raw.
    */
    pub fn frame_size(&self) -> Option<usize> {
        let bits = self.format.bits_per_pixel()? as usize;
        Some((self.width as usize * self.height as usize * bits).div_ceil(8))
    }
}

/**
    Shape of an audio stream.
*/
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct AudioInfo {
    /// Sample layout.
    pub format: AudioFormat,
    /// Number of interleaved channels.
    pub channels: u32,
    /// Speaker position bitmask (zero when unspecified).
    pub channel_mask: u32,
    /// Sample rate in Hz.
    pub rate: u32,
}

impl AudioInfo {
    /**
        Returns the number of bytes in one second of raw audio.
    */
    pub fn bytes_per_second(&self) -> Option<usize> {
        let bytes = self.format.bytes_per_sample()? as usize;
        Some(bytes * self.channels as usize * self.rate as usize)
    }
}

/**
    Format descriptor of one elementary stream.

    Negotiated formats are never patched in place: a renegotiation replaces
    the whole descriptor.
*/
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Format {
    #[default]
    Unknown,
    Audio(AudioInfo),
    Video(VideoInfo),
}

impl Format {
    /**
        Returns true for uncompressed audio or video.
    */
    pub fn is_raw(&self) -> bool {
        match self {
            Self::Audio(info) => {
                info.format != AudioFormat::Unknown && !info.format.is_compressed()
            }
            Self::Video(info) => {
                info.format != VideoFormat::Unknown && !info.format.is_compressed()
            }
            Self::Unknown => false,
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, Self::Video(_))
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, Self::Audio(_))
    }

    /**
        Returns true when frames of this format must be flipped vertically.
    */
    pub fn needs_vertical_flip(&self) -> bool {
        matches!(self, Self::Video(info) if info.format.is_rgb())
    }

    /**
        Returns the largest buffer a stream of this format carries: one frame
        of raw video, or one second of raw audio. Compressed and unknown
        formats have no fixed bound.
    */
    pub fn max_buffer_size(&self) -> Option<usize> {
        match self {
            Self::Video(info) => info.frame_size(),
            Self::Audio(info) => info.bytes_per_second(),
            Self::Unknown => None,
        }
    }

    /**
        Compares two descriptors for the purpose of accepting a renegotiation.

        Video frame rate is ignored: graphs routinely report a different or
        variable rate for the same stream. `Unknown` is never compatible.
    */
    pub fn is_compatible(&self, other: &Format) -> bool {
        match (self, other) {
            (Self::Audio(a), Self::Audio(b)) => {
                a.format == b.format && a.channels == b.channels && a.rate == b.rate
            }
            (Self::Video(a), Self::Video(b)) => {
                a.format == b.format && a.width == b.width && a.height == b.height
            }
            _ => false,
        }
    }
}

/**
    Display-crop rectangle applied to video output.

    A zero `right` or `bottom` means "extend to the frame edge".
*/
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Aperture {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl Aperture {
    pub const fn new(left: u32, top: u32, right: u32, bottom: u32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /**
        Returns true if the aperture crops nothing from a frame of the given size.
    */
    pub const fn is_full_frame(&self, width: u32, height: u32) -> bool {
        self.left == 0
            && self.top == 0
            && (self.right == 0 || self.right == width)
            && (self.bottom == 0 || self.bottom == height)
    }
}
