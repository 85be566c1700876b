mod reference;
mod suite;
mod virtual_pair;
